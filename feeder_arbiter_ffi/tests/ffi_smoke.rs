//! FFI smoke tests.
//!
//! These tests call the exported `extern "C"` functions directly (as an external consumer would),
//! to validate:
//! - ABI surface compiles and links
//! - the dispense callback reaches the host with its user_data
//! - allocation/free symmetry for returned buffers

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use feeder_arbiter_ffi::*;

const SESSION: &str = r#"
[[feeders]]
id = 1
position = [0.0, 0.0, 0.0]

[[agents]]
id = "bat1"
"#;

fn s(s: &str) -> FaStr {
    FaStr {
        ptr: s.as_ptr(),
        len: s.len(),
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs_f64()
}

unsafe extern "C" fn count_dispense(user_data: *mut c_void, feeder_id: u32, _duration_ms: u32, _speed: u8) -> u8 {
    let counter = &*(user_data as *const AtomicU32);
    counter.fetch_add(1, Ordering::SeqCst);
    u8::from(feeder_id == 1)
}

#[test]
fn ffi_version() {
    assert_eq!(feeder_arbiter_ffi_version(), FEEDER_ARBITER_FFI_VERSION);
}

#[test]
fn ffi_trigger_reward_and_free() {
    let counter = AtomicU32::new(0);
    let user_data = &counter as *const AtomicU32 as *mut c_void;

    unsafe {
        let h = feeder_arbiter_new(s(SESSION), Some(count_dispense), user_data);
        assert!(!h.is_null());

        let now = unix_now();
        assert_eq!(feeder_arbiter_push_position(h, s("bat1"), feeder_arbiter_str_none(), 0.2, 0.0, 0.0, now), 1);
        // older samples are ignored
        assert_eq!(feeder_arbiter_push_position(h, s("bat1"), feeder_arbiter_str_none(), 4.0, 0.0, 0.0, now - 1.0), 0);

        assert_eq!(feeder_arbiter_push_trigger(h, 1, now), FA_OK);
        let arr = feeder_arbiter_poll(h);
        assert_eq!(arr.outcomes_len, 1);
        let o = &*arr.outcomes_ptr;
        assert_eq!(o.feeder_id, 1);
        assert_eq!(o.delivered, 1);
        assert_eq!(o.deny_code, 0);
        let agent = std::slice::from_raw_parts(o.agent_id.ptr, o.agent_id.len);
        assert_eq!(agent, b"bat1");
        assert!((o.distance - 0.2).abs() < 1e-9);
        feeder_arbiter_outcomes_free(arr);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // agent went INACTIVE after the reward
        assert_eq!(feeder_arbiter_push_trigger(h, 1, now), FA_OK);
        let arr = feeder_arbiter_poll(h);
        assert_eq!(arr.outcomes_len, 1);
        let o = &*arr.outcomes_ptr;
        assert_eq!(o.delivered, 0);
        assert_eq!(o.deny_code, 4);
        feeder_arbiter_outcomes_free(arr);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let snap = feeder_arbiter_snapshot_json(h);
        assert!(!snap.ptr.is_null());
        let bytes = std::slice::from_raw_parts(snap.ptr, snap.len);
        let v: serde_json::Value = serde_json::from_slice(bytes).expect("snapshot is json");
        assert_eq!(v["feeders"][0]["owner_agent_id"], "bat1");
        assert_eq!(v["agents"][0]["id"], "bat1");
        feeder_arbiter_bytes_free(snap);

        feeder_arbiter_free(h);
    }
}

#[test]
fn ffi_manual_dispense_and_unknown_ids() {
    let counter = AtomicU32::new(0);
    let user_data = &counter as *const AtomicU32 as *mut c_void;

    unsafe {
        let h = feeder_arbiter_new(s(SESSION), Some(count_dispense), user_data);
        assert!(!h.is_null());

        assert_eq!(feeder_arbiter_manual_dispense(h, 1, feeder_arbiter_str_none()), 1);
        assert_eq!(feeder_arbiter_manual_dispense(h, 9, feeder_arbiter_str_none()), FA_ERR_NOT_FOUND);
        assert_eq!(feeder_arbiter_manual_dispense(h, 1, s("ghost")), FA_ERR_NOT_FOUND);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // empty poll returns an empty array that is still safe to free
        let arr = feeder_arbiter_poll(h);
        assert_eq!(arr.outcomes_len, 0);
        assert!(arr.outcomes_ptr.is_null());
        feeder_arbiter_outcomes_free(arr);

        // missing plugin file falls back to the default strategy
        assert_eq!(feeder_arbiter_reload_plugin(h, s("/definitely/not/here.toml")), 1);

        feeder_arbiter_free(h);
    }
}

#[test]
fn ffi_rejects_bad_input() {
    unsafe {
        assert!(feeder_arbiter_new(s("[[feeders]\nid = 1"), Some(count_dispense), ptr::null_mut()).is_null());
        assert!(feeder_arbiter_new(s(SESSION), None, ptr::null_mut()).is_null());

        let h = ptr::null_mut();
        assert_eq!(feeder_arbiter_push_position(h, s("bat1"), feeder_arbiter_str_none(), 0.0, 0.0, 0.0, 1.0), FA_ERR_NULL);
        assert_eq!(feeder_arbiter_push_trigger(h, 1, 1.0), FA_ERR_NULL);
        assert_eq!(feeder_arbiter_start(h), FA_ERR_NULL);
        assert_eq!(feeder_arbiter_stop(h), FA_ERR_NULL);
        let arr = feeder_arbiter_poll(h);
        assert!(arr.outcomes_ptr.is_null());
        feeder_arbiter_outcomes_free(arr);
        let snap = feeder_arbiter_snapshot_json(h);
        assert!(snap.ptr.is_null());
        feeder_arbiter_bytes_free(snap);
        feeder_arbiter_free(h);

        let bad = [0xffu8, 0xfe];
        let bad_str = FaStr {
            ptr: bad.as_ptr(),
            len: bad.len(),
        };
        let h = feeder_arbiter_new(s(SESSION), Some(count_dispense), ptr::null_mut());
        assert!(!h.is_null());
        assert_eq!(feeder_arbiter_push_position(h, bad_str, feeder_arbiter_str_none(), 0.0, 0.0, 0.0, 1.0), FA_ERR_UTF8);
        assert_eq!(feeder_arbiter_push_position(h, s("bat1"), bad_str, 0.0, 0.0, 0.0, 1.0), FA_ERR_UTF8);
        feeder_arbiter_free(h);
    }
}

#[test]
fn ffi_tag_id_reaches_auto_registered_agents() {
    unsafe {
        let h = feeder_arbiter_new(s(SESSION), Some(count_dispense), ptr::null_mut());
        assert!(!h.is_null());

        let now = unix_now();
        assert_eq!(feeder_arbiter_push_position(h, s("bat2"), s("uwb-9"), 5.0, 0.0, 0.0, now), 1);
        // empty tag means none; the agent id doubles as its tag
        assert_eq!(feeder_arbiter_push_position(h, s("bat3"), s(""), 5.0, 0.0, 0.0, now), 1);

        let snap = feeder_arbiter_snapshot_json(h);
        let bytes = std::slice::from_raw_parts(snap.ptr, snap.len);
        let v: serde_json::Value = serde_json::from_slice(bytes).expect("snapshot is json");
        let tag_of = |id: &str| {
            v["agents"]
                .as_array()
                .and_then(|agents| agents.iter().find(|a| a["id"] == id))
                .map(|a| a["tag_id"].clone())
        };
        assert_eq!(tag_of("bat2"), Some(serde_json::json!("uwb-9")));
        assert_eq!(tag_of("bat3"), Some(serde_json::json!("bat3")));
        feeder_arbiter_bytes_free(snap);

        feeder_arbiter_free(h);
    }
}
