// Read/write/seek/clear against the shared store. Each call takes the device lock
// interruptibly and either completes fully or leaves store and cursor untouched.
use crate::core::device::DeviceShared;
use crate::core::error::Error;
use crate::core::lock::InterruptFlag;
use crate::core::store::Whence;

/// Per-caller state the operations read and advance.
pub(crate) struct Caller<'a> {
    pub(crate) session_id: u64,
    pub(crate) cursor: &'a mut usize,
    pub(crate) interrupt: &'a InterruptFlag,
}

pub(crate) fn read(
    shared: &DeviceShared,
    caller: Caller<'_>,
    max_len: usize,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    with_read(shared, caller, max_len, |bytes| out.extend_from_slice(bytes))?;
    Ok(out)
}

pub(crate) fn read_into(
    shared: &DeviceShared,
    caller: Caller<'_>,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let max_len = buf.len();
    with_read(shared, caller, max_len, |bytes| {
        buf[..bytes.len()].copy_from_slice(bytes);
    })
}

fn with_read(
    shared: &DeviceShared,
    caller: Caller<'_>,
    max_len: usize,
    sink: impl FnOnce(&[u8]),
) -> Result<usize, Error> {
    let store = shared.store.lock_interruptible(caller.interrupt).inspect_err(|_| {
        tracing::debug!(session = caller.session_id, "read interrupted");
    })?;
    let offset = *caller.cursor;
    let bytes = store.read_at(offset, max_len);
    let n = bytes.len();
    sink(bytes);
    *caller.cursor = offset + n;
    drop(store);

    tracing::debug!(session = caller.session_id, offset, read = n, "read");
    Ok(n)
}

pub(crate) fn write(shared: &DeviceShared, caller: Caller<'_>, data: &[u8]) -> Result<usize, Error> {
    let mut store = shared.store.lock_interruptible(caller.interrupt).inspect_err(|_| {
        tracing::debug!(session = caller.session_id, "write interrupted");
    })?;
    let offset = *caller.cursor;
    let now = shared.clock.now();
    let written = store.write_at(offset, data, now).inspect_err(|_| {
        tracing::debug!(session = caller.session_id, offset, "write refused: no space");
    })?;
    *caller.cursor = offset + written;
    if !shared.timer.arm(now.saturating_add(shared.options.ttl)) {
        tracing::debug!(session = caller.session_id, "write after timer cancellation");
    }
    let length = store.len();
    drop(store);

    tracing::debug!(session = caller.session_id, offset, written, length, "write");
    Ok(written)
}

pub(crate) fn seek(
    shared: &DeviceShared,
    caller: Caller<'_>,
    whence: Whence,
    rel: i64,
) -> Result<usize, Error> {
    let store = shared.store.lock_interruptible(caller.interrupt).inspect_err(|_| {
        tracing::debug!(session = caller.session_id, "seek interrupted");
    })?;
    let raw = store.resolve_whence(whence, rel, *caller.cursor)?;
    let target = store.validate_seek(raw).inspect_err(|_| {
        tracing::debug!(session = caller.session_id, %whence, rel, raw, "seek rejected");
    })?;
    *caller.cursor = target;
    drop(store);

    tracing::debug!(session = caller.session_id, %whence, rel, cursor = target, "seek");
    Ok(target)
}

pub(crate) fn clear(shared: &DeviceShared, caller: Caller<'_>) -> Result<usize, Error> {
    let mut store = shared.store.lock_interruptible(caller.interrupt)?;
    let discarded = store.clear();
    drop(store);

    tracing::debug!(session = caller.session_id, discarded, "clear");
    Ok(discarded)
}
