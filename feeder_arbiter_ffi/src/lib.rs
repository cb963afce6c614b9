#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use tracing::error;

use feeder_arbiter_core::{ArbiterError, FeederId, PositionSample, Verdict};
use feeder_arbiter_supervisor::{
    parse_session_config, ArbitrationController, DispenseSink, LoadStatus, SystemClock,
    TriggerOutcome,
};

/// FFI ABI version for feeder_arbiter_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const FEEDER_ARBITER_FFI_VERSION: u32 = 2;

#[no_mangle]
pub extern "C" fn feeder_arbiter_ffi_version() -> u32 {
    FEEDER_ARBITER_FFI_VERSION
}

// Return codes shared by the functions below.
pub const FA_OK: i32 = 0;
pub const FA_ERR_NULL: i32 = -1;
pub const FA_ERR_UTF8: i32 = -2;
pub const FA_ERR_NOT_FOUND: i32 = -3;
pub const FA_ERR_NO_QUEUE: i32 = -4;
pub const FA_ERR_INTERNAL: i32 = -5;

/// Opaque handle exposed over FFI.
pub struct FaController {
    inner: Arc<ArbitrationController>,
}

/// FFI string view (UTF-8 bytes). A null `ptr` means "absent".
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FaStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl FaStr {
    const NONE: FaStr = FaStr {
        ptr: ptr::null(),
        len: 0,
    };

    /// `Ok(None)` for a null pointer, `Err` for invalid UTF-8.
    unsafe fn to_opt_str(&self) -> Result<Option<&str>, i32> {
        if self.ptr.is_null() {
            return Ok(None);
        }
        let bytes = std::slice::from_raw_parts(self.ptr, self.len);
        std::str::from_utf8(bytes).map(Some).map_err(|_| FA_ERR_UTF8)
    }

    unsafe fn to_str(&self) -> Result<&str, i32> {
        self.to_opt_str()?.ok_or(FA_ERR_NULL)
    }
}

/// Host dispense callback. Return non-zero when the motor run was acknowledged.
pub type FaDispenseFn =
    unsafe extern "C" fn(user_data: *mut c_void, feeder_id: u32, duration_ms: u32, speed: u8) -> u8;

struct CallbackSink {
    f: FaDispenseFn,
    user_data: *mut c_void,
}

// The host promises `user_data` may be used from the dispatcher thread.
unsafe impl Send for CallbackSink {}

impl DispenseSink for CallbackSink {
    fn dispense(&mut self, feeder_id: FeederId, duration_ms: u32, speed: u8) -> bool {
        unsafe { (self.f)(self.user_data, feeder_id, duration_ms, speed) != 0 }
    }
}

/// One trigger outcome.
/// Note: `agent_id` points into the string blob owned by the enclosing array.
#[repr(C)]
pub struct FaOutcome {
    pub feeder_id: u32,
    pub timestamp: f64,
    /// Null when no agent was attributed.
    pub agent_id: FaStr,
    /// NaN when no agent was attributed.
    pub distance: f64,
    pub delivered: u8,
    /// 0 when delivered, otherwise `DenyReason::code`.
    pub deny_code: i32,
}

/// Owned array returned over FFI.
#[repr(C)]
pub struct FaOutcomeArray {
    pub outcomes_ptr: *mut FaOutcome,
    pub outcomes_len: usize,

    // backing storage for strings (one blob) so agent_id pointers stay valid
    pub strings_ptr: *mut u8,
    pub strings_len: usize,
}

impl FaOutcomeArray {
    const EMPTY: FaOutcomeArray = FaOutcomeArray {
        outcomes_ptr: ptr::null_mut(),
        outcomes_len: 0,
        strings_ptr: ptr::null_mut(),
        strings_len: 0,
    };
}

/// Owned byte buffer (for snapshots).
#[repr(C)]
pub struct FaBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

fn leak_bytes(buf: Vec<u8>) -> FaBytes {
    let mut boxed = buf.into_boxed_slice();
    let ptr = boxed.as_mut_ptr();
    let len = boxed.len();
    std::mem::forget(boxed);
    FaBytes { ptr, len }
}

fn err_code(e: &ArbiterError) -> i32 {
    if e.is_not_found() {
        FA_ERR_NOT_FOUND
    } else {
        FA_ERR_INTERNAL
    }
}

/// Create a controller from a TOML session document.
///
/// Returns null if the session is invalid. Position and trigger timestamps must be UNIX
/// seconds. `dispense` runs on a dedicated dispatcher thread.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_new(
    session_toml: FaStr,
    dispense: Option<FaDispenseFn>,
    user_data: *mut c_void,
) -> *mut FaController {
    let Some(f) = dispense else {
        return ptr::null_mut();
    };
    let Ok(text) = session_toml.to_str() else {
        return ptr::null_mut();
    };
    let built = parse_session_config(text).and_then(|session| {
        ArbitrationController::builder(session)
            .clock(Arc::new(SystemClock))
            .sink(CallbackSink { f, user_data })
            .build()
    });
    match built {
        Ok(ctl) => Box::into_raw(Box::new(FaController {
            inner: Arc::new(ctl),
        })),
        Err(e) => {
            error!(error = %e, "feeder_arbiter_new failed");
            ptr::null_mut()
        }
    }
}

/// Stop the loop (if running) and release the handle.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_free(h: *mut FaController) {
    if !h.is_null() {
        let handle = Box::from_raw(h);
        handle.inner.stop();
        drop(handle);
    }
}

/// Returns 1 if the sample was applied, 0 if it was ignored (stale or non-finite).
/// `tag_id` may be null or empty; it is only used when the agent gets auto-registered.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_push_position(
    h: *mut FaController,
    agent_id: FaStr,
    tag_id: FaStr,
    x: f64,
    y: f64,
    z: f64,
    timestamp: f64,
) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    let handle = &*h;
    let id = match agent_id.to_str() {
        Ok(s) => s,
        Err(rc) => return rc,
    };
    let tag = match tag_id.to_opt_str() {
        Ok(t) => t.filter(|t| !t.is_empty()),
        Err(rc) => return rc,
    };
    match handle
        .inner
        .ingest_position(id, tag, PositionSample::new(x, y, z, timestamp))
    {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => err_code(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_push_trigger(h: *mut FaController, feeder_id: u32, timestamp: f64) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    let handle = &*h;
    match handle.inner.trigger_producer() {
        Some(p) if p.push(feeder_id, timestamp) => FA_OK,
        _ => FA_ERR_NO_QUEUE,
    }
}

fn outcomes_to_ffi(outcomes: Vec<TriggerOutcome>) -> FaOutcomeArray {
    if outcomes.is_empty() {
        return FaOutcomeArray::EMPTY;
    }

    // Build a single backing blob for agent_id strings
    let mut strings: Vec<u8> = Vec::new();
    let mut out: Vec<FaOutcome> = Vec::with_capacity(outcomes.len());
    let mut offsets: Vec<Option<usize>> = Vec::with_capacity(outcomes.len());

    for o in outcomes {
        let len = match &o.agent_id {
            Some(id) => {
                offsets.push(Some(strings.len()));
                strings.extend_from_slice(id.as_bytes());
                id.len()
            }
            None => {
                offsets.push(None);
                0
            }
        };
        let (delivered, deny_code) = match &o.verdict {
            Verdict::Delivered => (1, 0),
            Verdict::Denied(reason) => (0, reason.code()),
        };
        out.push(FaOutcome {
            feeder_id: o.feeder_id,
            timestamp: o.timestamp,
            // fixed up after we pin the backing string blob
            agent_id: FaStr { ptr: ptr::null(), len },
            distance: o.distance.unwrap_or(f64::NAN),
            delivered,
            deny_code,
        });
    }

    // Pin buffers and fix pointers
    let mut strings_box = strings.into_boxed_slice();
    let strings_ptr = strings_box.as_mut_ptr();
    let strings_len = strings_box.len();

    let mut out_box = out.into_boxed_slice();
    let outcomes_ptr = out_box.as_mut_ptr();
    let outcomes_len = out_box.len();

    for (o, off) in out_box.iter_mut().zip(offsets) {
        if let Some(off) = off {
            // SAFETY: off + len lies within the pinned blob
            o.agent_id.ptr = unsafe { strings_ptr.add(off) };
        }
    }

    // Leak boxes to caller; freed by feeder_arbiter_outcomes_free
    std::mem::forget(strings_box);
    std::mem::forget(out_box);

    FaOutcomeArray {
        outcomes_ptr,
        outcomes_len,
        strings_ptr,
        strings_len,
    }
}

/// Drain and handle pending triggers on the calling thread.
/// Returns an owned array (must be freed with `feeder_arbiter_outcomes_free`).
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_poll(h: *mut FaController) -> FaOutcomeArray {
    if h.is_null() {
        return FaOutcomeArray::EMPTY;
    }
    let handle = &*h;
    outcomes_to_ffi(handle.inner.poll_once())
}

#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_outcomes_free(arr: FaOutcomeArray) {
    if !arr.outcomes_ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(arr.outcomes_ptr, arr.outcomes_len);
        drop(Box::from_raw(slice_ptr));
    }
    if !arr.strings_ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(arr.strings_ptr, arr.strings_len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// Run the polling loop on a background thread.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_start(h: *mut FaController) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    let handle = &*h;
    match handle.inner.start() {
        Ok(()) => FA_OK,
        Err(e) => err_code(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_stop(h: *mut FaController) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    (*h).inner.stop();
    FA_OK
}

/// Operator reward. `agent_id` may be null.
/// Returns 1 when delivered, 0 on hardware failure, negative on bad arguments.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_manual_dispense(h: *mut FaController, feeder_id: u32, agent_id: FaStr) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    let handle = &*h;
    let agent = match agent_id.to_opt_str() {
        Ok(a) => a,
        Err(rc) => return rc,
    };
    match handle.inner.manual_dispense(feeder_id, agent) {
        Ok(v) if v.is_delivered() => 1,
        Ok(_) => 0,
        Err(e) => err_code(&e),
    }
}

/// Swap the decision plugin. A null `path` re-reads the current file.
/// Returns 0 when the plugin loaded, 1 when the default strategy took over.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_reload_plugin(h: *mut FaController, path: FaStr) -> i32 {
    if h.is_null() {
        return FA_ERR_NULL;
    }
    let handle = &*h;
    let status = match path.to_opt_str() {
        Ok(Some(p)) => handle.inner.reload_plugin(Some(Path::new(p)), None),
        Ok(None) => handle.inner.adapter().reload_file(),
        Err(rc) => return rc,
    };
    match status {
        LoadStatus::Loaded { .. } => 0,
        LoadStatus::Fallback { .. } => 1,
    }
}

/// Whole-store snapshot as UTF-8 JSON. Free with `feeder_arbiter_bytes_free`.
#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_snapshot_json(h: *mut FaController) -> FaBytes {
    if h.is_null() {
        return FaBytes { ptr: ptr::null_mut(), len: 0 };
    }
    let handle = &*h;
    match serde_json::to_vec(&handle.inner.store().snapshot()) {
        Ok(buf) => leak_bytes(buf),
        Err(e) => {
            error!(error = %e, "snapshot serialization failed");
            FaBytes { ptr: ptr::null_mut(), len: 0 }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn feeder_arbiter_bytes_free(b: FaBytes) {
    if !b.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(b.ptr, b.len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// A null `FaStr`, for optional string arguments.
#[no_mangle]
pub extern "C" fn feeder_arbiter_str_none() -> FaStr {
    FaStr::NONE
}
