// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// C-ABI facade: a flat {create, setup, op…, destroy} function table per
// pattern over opaque heap handles, for thin client-language bindings.
//
// Ownership rules at this boundary:
// - create/destroy pair up; destroy accepts NULL.
// - Returned strings come from `CString::into_raw` and must go back through
//   `crossipc_string_free`; returned buffers through `crossipc_buffer_free`.
// - Callback `user_data` is carried verbatim and never dereferenced by the
//   library; the callback runs on a library background thread.

use std::ffi::{c_char, c_void, CStr, CString};
use std::slice;

use log::warn;

use crate::dispenser::{DispenserMode, ShmDispenser};
use crate::pubsub::PubSub;
use crate::region::SharedRegion;
use crate::reqresp::ReqResp;
use crate::store_dict::StoreDict;

/// # Safety
/// `p` must be NULL or a valid NUL-terminated string.
unsafe fn cstr_arg<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

fn string_out(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn buffer_out(bytes: Vec<u8>, out_len: *mut usize) -> *mut u8 {
    let boxed = bytes.into_boxed_slice();
    if !out_len.is_null() {
        unsafe { *out_len = boxed.len() };
    }
    Box::into_raw(boxed) as *mut u8
}

/// Free a string returned by this library.
///
/// # Safety
/// `p` must be NULL or a pointer previously returned by a `*_string` export.
#[no_mangle]
pub unsafe extern "C" fn crossipc_string_free(p: *mut c_char) {
    if !p.is_null() {
        drop(CString::from_raw(p));
    }
}

/// Free a buffer returned by this library.
///
/// # Safety
/// `p`/`len` must be NULL/0 or the exact pair returned by a buffer export.
#[no_mangle]
pub unsafe extern "C" fn crossipc_buffer_free(p: *mut u8, len: usize) {
    if !p.is_null() {
        drop(Box::from_raw(slice::from_raw_parts_mut(p, len)));
    }
}

// ---------------------------------------------------------------------------
// SharedRegion
// ---------------------------------------------------------------------------

/// # Safety
/// `id` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_create(id: *const c_char, size: usize) -> *mut SharedRegion {
    let Some(id) = cstr_arg(id) else {
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(SharedRegion::new(id, size)))
}

/// # Safety
/// `region` must be NULL or a pointer from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_destroy(region: *mut SharedRegion) {
    if !region.is_null() {
        drop(Box::from_raw(region));
    }
}

/// # Safety
/// `region` must be a pointer from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_setup(region: *mut SharedRegion) -> bool {
    let Some(region) = region.as_mut() else {
        return false;
    };
    region.setup().is_ok()
}

/// # Safety
/// `region` from `crossipc_region_create`; `data` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_write(
    region: *mut SharedRegion,
    data: *const u8,
    len: usize,
) -> bool {
    let Some(region) = region.as_ref() else {
        return false;
    };
    if data.is_null() {
        return false;
    }
    region.write(slice::from_raw_parts(data, len)).is_ok()
}

/// # Safety
/// `region` from `crossipc_region_create`; `data` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_write_locked(
    region: *mut SharedRegion,
    data: *const u8,
    len: usize,
    timeout_ms: u64,
) -> bool {
    let Some(region) = region.as_mut() else {
        return false;
    };
    if data.is_null() {
        return false;
    }
    region
        .write_locked(slice::from_raw_parts(data, len), timeout_ms)
        .unwrap_or(false)
}

/// Full-region copy; free with `crossipc_buffer_free`.
///
/// # Safety
/// `region` from `crossipc_region_create`; `out_len` NULL or writable.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_read(
    region: *mut SharedRegion,
    out_len: *mut usize,
) -> *mut u8 {
    let Some(region) = region.as_ref() else {
        return std::ptr::null_mut();
    };
    match region.read() {
        Ok(bytes) => buffer_out(bytes, out_len),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Region contents up to the first NUL; free with `crossipc_string_free`.
///
/// # Safety
/// `region` from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_read_string(region: *mut SharedRegion) -> *mut c_char {
    let Some(region) = region.as_ref() else {
        return std::ptr::null_mut();
    };
    match region.read_string() {
        Ok(s) => string_out(s),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `region` from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_clear(region: *mut SharedRegion) -> bool {
    let Some(region) = region.as_ref() else {
        return false;
    };
    region.clear().is_ok()
}

/// # Safety
/// `region` from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_close(region: *mut SharedRegion) {
    if let Some(region) = region.as_mut() {
        region.close();
    }
}

/// # Safety
/// `region` from `crossipc_region_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_region_unlink(region: *mut SharedRegion) -> bool {
    let Some(region) = region.as_mut() else {
        return false;
    };
    region.unlink().is_ok()
}

// ---------------------------------------------------------------------------
// StoreDict
// ---------------------------------------------------------------------------

/// # Safety
/// `id` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_create(
    id: *const c_char,
    size: usize,
) -> *mut StoreDict {
    let Some(id) = cstr_arg(id) else {
        return std::ptr::null_mut();
    };
    match StoreDict::new(id, size) {
        Ok(store) => Box::into_raw(Box::new(store)),
        Err(e) => {
            warn!("store_dict_create '{id}' failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `store` must be NULL or a pointer from `crossipc_store_dict_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_destroy(store: *mut StoreDict) {
    if !store.is_null() {
        drop(Box::from_raw(store));
    }
}

/// # Safety
/// `store` from `crossipc_store_dict_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_setup(store: *mut StoreDict) -> bool {
    let Some(store) = store.as_mut() else {
        return false;
    };
    store.setup().unwrap_or(false)
}

/// # Safety
/// `store` from create; `key` NUL-terminated; `value` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_store(
    store: *mut StoreDict,
    key: *const c_char,
    value: *const u8,
    len: usize,
) -> bool {
    let Some(store) = store.as_mut() else {
        return false;
    };
    let (Some(key), false) = (cstr_arg(key), value.is_null()) else {
        return false;
    };
    store
        .store(key, slice::from_raw_parts(value, len))
        .unwrap_or(false)
}

/// # Safety
/// `store` from create; `key`/`value` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_store_string(
    store: *mut StoreDict,
    key: *const c_char,
    value: *const c_char,
) -> bool {
    let Some(store) = store.as_mut() else {
        return false;
    };
    let (Some(key), Some(value)) = (cstr_arg(key), cstr_arg(value)) else {
        return false;
    };
    store.store_string(key, value).unwrap_or(false)
}

/// Owned copy of the value; free with `crossipc_buffer_free`.
///
/// # Safety
/// `store` from create; `key` NUL-terminated; `out_len` NULL or writable.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_retrieve(
    store: *mut StoreDict,
    key: *const c_char,
    out_len: *mut usize,
) -> *mut u8 {
    let Some(store) = store.as_mut() else {
        return std::ptr::null_mut();
    };
    let Some(key) = cstr_arg(key) else {
        return std::ptr::null_mut();
    };
    match store.retrieve(key) {
        Ok(Some(value)) => buffer_out(value, out_len),
        _ => std::ptr::null_mut(),
    }
}

/// Value as a string; free with `crossipc_string_free`.
///
/// # Safety
/// `store` from create; `key` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_retrieve_string(
    store: *mut StoreDict,
    key: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_mut() else {
        return std::ptr::null_mut();
    };
    let Some(key) = cstr_arg(key) else {
        return std::ptr::null_mut();
    };
    match store.retrieve_string(key) {
        Ok(Some(value)) => string_out(value),
        _ => std::ptr::null_mut(),
    }
}

/// # Safety
/// `store` from create; `key` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_delete(
    store: *mut StoreDict,
    key: *const c_char,
) -> bool {
    let Some(store) = store.as_mut() else {
        return false;
    };
    let Some(key) = cstr_arg(key) else {
        return false;
    };
    store.delete(key).unwrap_or(false)
}

/// # Safety
/// `store` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_load(store: *mut StoreDict) {
    if let Some(store) = store.as_mut() {
        store.load();
    }
}

/// # Safety
/// `store` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_store_dict_close(store: *mut StoreDict) {
    if let Some(store) = store.as_mut() {
        store.close();
    }
}

// ---------------------------------------------------------------------------
// PubSub
// ---------------------------------------------------------------------------

/// Subscriber callback: `(topic, payload, payload_len, user_data)`.
/// Invoked on the library's poller thread.
pub type PubSubCallback =
    unsafe extern "C" fn(*const c_char, *const u8, usize, *mut c_void);

struct CallbackCtx {
    callback: PubSubCallback,
    user_data: *mut c_void,
}

// The facade only carries the pointer across threads; the callback owns
// whatever synchronization its user_data needs.
unsafe impl Send for CallbackCtx {}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_create(name: *const c_char, size: usize) -> *mut PubSub {
    let Some(name) = cstr_arg(name) else {
        return std::ptr::null_mut();
    };
    match PubSub::new(name, size) {
        Ok(pubsub) => Box::into_raw(Box::new(pubsub)),
        Err(e) => {
            warn!("pubsub_create '{name}' failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `pubsub` must be NULL or a pointer from `crossipc_pubsub_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_destroy(pubsub: *mut PubSub) {
    if !pubsub.is_null() {
        drop(Box::from_raw(pubsub));
    }
}

/// # Safety
/// `pubsub` from `crossipc_pubsub_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_setup(pubsub: *mut PubSub) -> bool {
    let Some(pubsub) = pubsub.as_mut() else {
        return false;
    };
    pubsub.setup().is_ok()
}

/// # Safety
/// `pubsub` from create; `topic` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_create_topic(
    pubsub: *mut PubSub,
    topic: *const c_char,
) -> bool {
    let Some(pubsub) = pubsub.as_ref() else {
        return false;
    };
    let Some(topic) = cstr_arg(topic) else {
        return false;
    };
    pubsub.create_topic(topic).unwrap_or(false)
}

/// # Safety
/// `pubsub` from create; `topic` NUL-terminated; `payload` valid for `len`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_publish(
    pubsub: *mut PubSub,
    topic: *const c_char,
    payload: *const u8,
    len: usize,
) -> bool {
    let Some(pubsub) = pubsub.as_ref() else {
        return false;
    };
    let (Some(topic), false) = (cstr_arg(topic), payload.is_null()) else {
        return false;
    };
    pubsub
        .publish(topic, slice::from_raw_parts(payload, len))
        .unwrap_or(false)
}

/// # Safety
/// `pubsub` from create; `topic`/`message` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_publish_string(
    pubsub: *mut PubSub,
    topic: *const c_char,
    message: *const c_char,
) -> bool {
    let Some(pubsub) = pubsub.as_ref() else {
        return false;
    };
    let (Some(topic), Some(message)) = (cstr_arg(topic), cstr_arg(message)) else {
        return false;
    };
    pubsub.publish_string(topic, message).unwrap_or(false)
}

/// # Safety
/// `pubsub` from create; `topic` NUL-terminated; `callback` stays valid for
/// the lifetime of the pubsub; `user_data` is carried verbatim.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_subscribe(
    pubsub: *mut PubSub,
    topic: *const c_char,
    callback: PubSubCallback,
    user_data: *mut c_void,
) -> bool {
    let Some(pubsub) = pubsub.as_ref() else {
        return false;
    };
    let Some(topic) = cstr_arg(topic) else {
        return false;
    };
    let ctx = CallbackCtx {
        callback,
        user_data,
    };
    pubsub.subscribe(topic, move |topic, payload| {
        let ctx = &ctx;
        let Ok(c_topic) = CString::new(topic) else {
            return;
        };
        unsafe {
            (ctx.callback)(
                c_topic.as_ptr(),
                payload.as_ptr(),
                payload.len(),
                ctx.user_data,
            )
        };
    });
    true
}

/// # Safety
/// `pubsub` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_pubsub_close(pubsub: *mut PubSub) {
    if let Some(pubsub) = pubsub.as_mut() {
        pubsub.close();
    }
}

// ---------------------------------------------------------------------------
// ShmDispenser
// ---------------------------------------------------------------------------

fn mode_from_raw(mode: i32) -> Option<DispenserMode> {
    match mode {
        0 => Some(DispenserMode::Fifo),
        1 => Some(DispenserMode::Lifo),
        2 => Some(DispenserMode::Deque),
        _ => None,
    }
}

/// `mode`: 0 = FIFO, 1 = LIFO, 2 = DEQUE.
///
/// # Safety
/// `id` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_create(
    id: *const c_char,
    mode: i32,
) -> *mut ShmDispenser {
    let (Some(id), Some(mode)) = (cstr_arg(id), mode_from_raw(mode)) else {
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(ShmDispenser::new(id, mode)))
}

/// # Safety
/// `dispenser` must be NULL or a pointer from `crossipc_dispenser_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_destroy(dispenser: *mut ShmDispenser) {
    if !dispenser.is_null() {
        drop(Box::from_raw(dispenser));
    }
}

/// Provider passes real dimensions; a consumer joins with `0, 0`.
///
/// # Safety
/// `dispenser` from `crossipc_dispenser_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_setup(
    dispenser: *mut ShmDispenser,
    capacity: usize,
    item_size: usize,
) -> bool {
    let Some(dispenser) = dispenser.as_mut() else {
        return false;
    };
    dispenser.setup(capacity, item_size).is_ok()
}

/// # Safety
/// `dispenser` from create; `item` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_add_string(
    dispenser: *mut ShmDispenser,
    item: *const c_char,
) -> bool {
    let Some(dispenser) = dispenser.as_ref() else {
        return false;
    };
    let Some(item) = cstr_arg(item) else {
        return false;
    };
    dispenser.add_string(item).unwrap_or(false)
}

/// # Safety
/// `dispenser` from create; `item` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_add_string_front(
    dispenser: *mut ShmDispenser,
    item: *const c_char,
) -> bool {
    let Some(dispenser) = dispenser.as_ref() else {
        return false;
    };
    let Some(item) = cstr_arg(item) else {
        return false;
    };
    dispenser.add_string_front(item).unwrap_or(false)
}

/// Free the result with `crossipc_string_free`; NULL when empty.
///
/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_dispense_string(
    dispenser: *mut ShmDispenser,
) -> *mut c_char {
    let Some(dispenser) = dispenser.as_ref() else {
        return std::ptr::null_mut();
    };
    match dispenser.dispense_string() {
        Ok(Some(item)) => string_out(item),
        _ => std::ptr::null_mut(),
    }
}

/// Free the result with `crossipc_string_free`; NULL when empty.
///
/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_dispense_string_back(
    dispenser: *mut ShmDispenser,
) -> *mut c_char {
    let Some(dispenser) = dispenser.as_ref() else {
        return std::ptr::null_mut();
    };
    match dispenser.dispense_string_back() {
        Ok(Some(item)) => string_out(item),
        _ => std::ptr::null_mut(),
    }
}

/// Free the result with `crossipc_string_free`; NULL when empty.
///
/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_peek_string(
    dispenser: *mut ShmDispenser,
) -> *mut c_char {
    let Some(dispenser) = dispenser.as_ref() else {
        return std::ptr::null_mut();
    };
    match dispenser.peek_string() {
        Ok(Some(item)) => string_out(item),
        _ => std::ptr::null_mut(),
    }
}

/// Free the result with `crossipc_string_free`; NULL when empty.
///
/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_peek_string_back(
    dispenser: *mut ShmDispenser,
) -> *mut c_char {
    let Some(dispenser) = dispenser.as_ref() else {
        return std::ptr::null_mut();
    };
    match dispenser.peek_string_back() {
        Ok(Some(item)) => string_out(item),
        _ => std::ptr::null_mut(),
    }
}

/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_is_empty(dispenser: *mut ShmDispenser) -> bool {
    let Some(dispenser) = dispenser.as_ref() else {
        return true;
    };
    dispenser.is_empty().unwrap_or(true)
}

/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_is_full(dispenser: *mut ShmDispenser) -> bool {
    let Some(dispenser) = dispenser.as_ref() else {
        return true;
    };
    dispenser.is_full().unwrap_or(true)
}

/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_clear(dispenser: *mut ShmDispenser) -> bool {
    let Some(dispenser) = dispenser.as_ref() else {
        return false;
    };
    dispenser.clear().is_ok()
}

/// # Safety
/// `dispenser` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_dispenser_close(dispenser: *mut ShmDispenser) {
    if let Some(dispenser) = dispenser.as_mut() {
        dispenser.close();
    }
}

// ---------------------------------------------------------------------------
// ReqResp
// ---------------------------------------------------------------------------

/// Server callback: maps a request to a reply. The returned pointer must
/// stay valid until the callback returns; the library copies it immediately.
/// Returning NULL sends an empty reply.
pub type ReqRespHandler =
    unsafe extern "C" fn(*const c_char, *mut c_void) -> *const c_char;

struct HandlerCtx {
    handler: ReqRespHandler,
    user_data: *mut c_void,
}

unsafe impl Send for HandlerCtx {}

#[no_mangle]
pub extern "C" fn crossipc_reqresp_create() -> *mut ReqResp {
    Box::into_raw(Box::new(ReqResp::new()))
}

/// # Safety
/// `rr` must be NULL or a pointer from `crossipc_reqresp_create`.
#[no_mangle]
pub unsafe extern "C" fn crossipc_reqresp_destroy(rr: *mut ReqResp) {
    if !rr.is_null() {
        drop(Box::from_raw(rr));
    }
}

/// # Safety
/// `rr` from create; `id` NUL-terminated; `handler` stays valid for the
/// lifetime of the endpoint; `user_data` is carried verbatim.
#[no_mangle]
pub unsafe extern "C" fn crossipc_reqresp_respond(
    rr: *mut ReqResp,
    id: *const c_char,
    handler: ReqRespHandler,
    user_data: *mut c_void,
) -> bool {
    let Some(rr) = rr.as_mut() else {
        return false;
    };
    let Some(id) = cstr_arg(id) else {
        return false;
    };
    let ctx = HandlerCtx { handler, user_data };
    rr.respond(id, move |request| {
        let ctx = &ctx;
        let Ok(c_request) = CString::new(request) else {
            return String::new();
        };
        let reply = unsafe { (ctx.handler)(c_request.as_ptr(), ctx.user_data) };
        if reply.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(reply) }
            .to_string_lossy()
            .into_owned()
    })
    .is_ok()
}

/// # Safety
/// `rr` from create; `id` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_reqresp_setup_client(
    rr: *mut ReqResp,
    id: *const c_char,
) -> bool {
    let Some(rr) = rr.as_mut() else {
        return false;
    };
    let Some(id) = cstr_arg(id) else {
        return false;
    };
    rr.setup_client(id).is_ok()
}

/// Round trip; free the reply with `crossipc_string_free`.
///
/// # Safety
/// `rr` from create; `id`/`message` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn crossipc_reqresp_request(
    rr: *mut ReqResp,
    id: *const c_char,
    message: *const c_char,
) -> *mut c_char {
    let Some(rr) = rr.as_mut() else {
        return std::ptr::null_mut();
    };
    let (Some(id), Some(message)) = (cstr_arg(id), cstr_arg(message)) else {
        return std::ptr::null_mut();
    };
    match rr.request(id, message) {
        Ok(Some(reply)) => string_out(reply),
        _ => std::ptr::null_mut(),
    }
}

/// # Safety
/// `rr` from create.
#[no_mangle]
pub unsafe extern "C" fn crossipc_reqresp_close(rr: *mut ReqResp) {
    if let Some(rr) = rr.as_mut() {
        rr.close();
    }
}
