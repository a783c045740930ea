//! C ABI for host embedding (the static library target).
//!
//! Hosts hold an opaque handle owning the SQLite connection and pass it
//! back to every call. Errors are reported per thread through
//! `synq_last_error_code` / `synq_last_error_message`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use crate::{Config, Replica};

/// Opaque handle that owns a SQLite connection.
pub struct SynqConnHandle {
    conn: rusqlite::Connection,
}

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = RefCell::new((0, String::new()));
}

fn set_last_error(code: i32, msg: &str) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.to_string()));
}

fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s)
        .map(|cs| cs.into_raw())
        .unwrap_or(std::ptr::null_mut())
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn synq_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Open a SQLite connection. Path can be a file path or ":memory:".
/// Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn synq_open(path: *const c_char) -> *mut SynqConnHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    match rusqlite::Connection::open(path) {
        Ok(conn) => {
            clear_last_error();
            Box::into_raw(Box::new(SynqConnHandle { conn }))
        }
        Err(e) => {
            set_last_error(1, &format!("sqlite: {}", e));
            std::ptr::null_mut()
        }
    }
}

/// Close a previously opened connection.
#[unsafe(no_mangle)]
pub extern "C" fn synq_close(handle: *mut SynqConnHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

/// Make the database a replicated database. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn synq_init(handle: *mut SynqConnHandle) -> c_int {
    let h = unsafe { handle.as_mut() };
    if let Some(h) = h {
        match Replica::with_config(&h.conn, Config::default()).init() {
            Ok(_) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{}", e));
                1
            }
        }
    } else {
        set_last_error(4, "null handle");
        2
    }
}

/// Clone `src` into `tgt` and give `tgt` a fresh peer id. Returns 0 on
/// success.
#[unsafe(no_mangle)]
pub extern "C" fn synq_clone_to(
    src: *mut SynqConnHandle,
    tgt: *mut SynqConnHandle,
) -> c_int {
    let (src, tgt) = unsafe { (src.as_mut(), tgt.as_mut()) };
    let (src, tgt) = match (src, tgt) {
        (Some(s), Some(t)) => (s, t),
        _ => {
            set_last_error(4, "null handle");
            return 2;
        }
    };
    match Replica::new(&src.conn).clone_to(&mut tgt.conn) {
        Ok(_) => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(1, &format!("{}", e));
            1
        }
    }
}

/// Pull the state of the replica stored at `remote_path`. Returns 0 on
/// success.
#[unsafe(no_mangle)]
pub extern "C" fn synq_pull_from(
    handle: *mut SynqConnHandle,
    remote_path: *const c_char,
) -> c_int {
    let h = unsafe { handle.as_mut() };
    let remote = match ptr_to_str(remote_path) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid remote path");
            return 3;
        }
    };
    if let Some(h) = h {
        match Replica::new(&h.conn).pull_from(remote) {
            Ok(_) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{}", e));
                1
            }
        }
    } else {
        set_last_error(4, "null handle");
        2
    }
}

/// Write a causal-context snapshot at `path`. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn synq_fingerprint(
    handle: *mut SynqConnHandle,
    path: *const c_char,
) -> c_int {
    let h = unsafe { handle.as_mut() };
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid path");
            return 3;
        }
    };
    if let Some(h) = h {
        match Replica::new(&h.conn).fingerprint(path) {
            Ok(_) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{}", e));
                1
            }
        }
    } else {
        set_last_error(4, "null handle");
        2
    }
}

/// Read the replica identifier. Returns 0 on success and writes `out_peer`.
#[unsafe(no_mangle)]
pub extern "C" fn synq_peer(handle: *mut SynqConnHandle, out_peer: *mut i64) -> c_int {
    if out_peer.is_null() {
        set_last_error(4, "out_peer is null");
        return 3;
    }
    let h = unsafe { handle.as_mut() };
    if let Some(h) = h {
        match Replica::new(&h.conn).peer() {
            Ok(peer) => {
                unsafe { *out_peer = peer };
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(1, &format!("{}", e));
                1
            }
        }
    } else {
        set_last_error(4, "null handle");
        2
    }
}

/// Last error code for the current thread.
#[unsafe(no_mangle)]
pub extern "C" fn synq_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Last error message for the current thread as a newly allocated C string.
/// Free with `synq_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn synq_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn round_trip_through_the_c_abi() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = c_path(&dir.path().join("a.db"));
        let b_path = c_path(&dir.path().join("b.db"));

        let a = synq_open(a_path.as_ptr());
        assert!(!a.is_null());
        unsafe { &(*a).conn }
            .execute_batch("CREATE TABLE x(v any PRIMARY KEY);")
            .unwrap();
        assert_eq!(synq_init(a), 0);

        let b = synq_open(b_path.as_ptr());
        assert_eq!(synq_clone_to(a, b), 0);

        let mut peer_a = 0;
        let mut peer_b = 0;
        assert_eq!(synq_peer(a, &mut peer_a), 0);
        assert_eq!(synq_peer(b, &mut peer_b), 0);
        assert_ne!(peer_a, peer_b);

        unsafe { &(*a).conn }
            .execute("INSERT INTO x VALUES('v1')", [])
            .unwrap();
        assert_eq!(synq_pull_from(b, a_path.as_ptr()), 0);
        let count: i64 = unsafe { &(*b).conn }
            .query_row("SELECT count(*) FROM x", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        synq_close(a);
        synq_close(b);
    }

    #[test]
    fn errors_surface_through_the_thread_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = c_path(&dir.path().join("bad.db"));
        let h = synq_open(path.as_ptr());
        unsafe { &(*h).conn }
            .execute_batch("CREATE TABLE x(v text PRIMARY KEY) WITHOUT ROWID;")
            .unwrap();
        assert_ne!(synq_init(h), 0);
        assert_ne!(synq_last_error_code(), 0);
        let msg = synq_last_error_message();
        assert!(!msg.is_null());
        synq_string_free(msg);
        synq_close(h);
    }
}
