//! Bindings to the private libxpc pipe API and the Mach VM calls it needs.
//!
//! This is the only module in the workspace that contains `unsafe` code.
//! Every XPC object and every VM region is owned by an RAII guard, so a
//! request's shared-memory region is always released before [`exchange`]
//! returns and is never reused by a later call.

#![allow(unsafe_code)]

use std::alloc::{Layout, handle_alloc_error};
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::OnceLock;

use tracing::error;

use crate::launchd::protocol::{AttributeEndpoint, Reply, Request, ServiceAttributes};
use crate::launchd::transport::{TransportError, decode_text_payload};

#[allow(non_camel_case_types)]
type xpc_object_t = *mut c_void;
#[allow(non_camel_case_types)]
type mach_port_t = u32;
#[allow(non_camel_case_types)]
type kern_return_t = c_int;
#[allow(non_camel_case_types)]
type mach_vm_address_t = u64;
#[allow(non_camel_case_types)]
type mach_vm_size_t = u64;
#[allow(non_camel_case_types)]
type mach_msg_type_number_t = u32;

const KERN_SUCCESS: kern_return_t = 0;
const VM_FLAGS_ANYWHERE: c_int = 0x0001;

/// Opaque `struct _xpc_type_s`.
#[repr(C)]
struct XpcType {
    _private: [u8; 0],
}

#[link(name = "System", kind = "dylib")]
unsafe extern "C" {
    static mach_task_self_: mach_port_t;
    static _xpc_type_dictionary: XpcType;
    static _xpc_type_array: XpcType;

    fn mach_ports_lookup(
        target_task: mach_port_t,
        init_port_set: *mut *mut mach_port_t,
        init_port_set_cnt: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
    fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;
    fn mach_vm_allocate(
        target: mach_port_t,
        address: *mut mach_vm_address_t,
        size: mach_vm_size_t,
        flags: c_int,
    ) -> kern_return_t;
    fn mach_vm_deallocate(
        target: mach_port_t,
        address: mach_vm_address_t,
        size: mach_vm_size_t,
    ) -> kern_return_t;

    fn xpc_dictionary_create(
        keys: *const *const c_char,
        values: *const xpc_object_t,
        count: usize,
    ) -> xpc_object_t;
    fn xpc_dictionary_set_uint64(xdict: xpc_object_t, key: *const c_char, value: u64);
    fn xpc_dictionary_set_string(xdict: xpc_object_t, key: *const c_char, string: *const c_char);
    fn xpc_dictionary_set_value(xdict: xpc_object_t, key: *const c_char, value: xpc_object_t);
    fn xpc_dictionary_get_uint64(xdict: xpc_object_t, key: *const c_char) -> u64;
    fn xpc_dictionary_get_int64(xdict: xpc_object_t, key: *const c_char) -> i64;
    fn xpc_dictionary_get_bool(xdict: xpc_object_t, key: *const c_char) -> bool;
    fn xpc_dictionary_get_string(xdict: xpc_object_t, key: *const c_char) -> *const c_char;
    fn xpc_dictionary_get_value(xdict: xpc_object_t, key: *const c_char) -> xpc_object_t;
    fn xpc_array_get_count(xarray: xpc_object_t) -> usize;
    fn xpc_array_get_value(xarray: xpc_object_t, index: usize) -> xpc_object_t;
    fn xpc_get_type(object: xpc_object_t) -> *const XpcType;
    fn xpc_shmem_create(region: *mut c_void, length: usize) -> xpc_object_t;
    fn xpc_release(object: xpc_object_t);

    fn xpc_pipe_create_from_port(port: mach_port_t, flags: u64) -> xpc_object_t;
    fn xpc_pipe_routine(
        pipe: xpc_object_t,
        message: xpc_object_t,
        reply: *mut xpc_object_t,
    ) -> c_int;
    fn xpc_strerror(error: c_int) -> *const c_char;
}

fn task_self() -> mach_port_t {
    // SAFETY: `mach_task_self_` is initialised by libSystem before main and never written again.
    unsafe { mach_task_self_ }
}

/// Owned reference to an XPC object, released on drop.
struct XpcObject(xpc_object_t);

impl XpcObject {
    fn new(raw: xpc_object_t) -> Option<Self> {
        (!raw.is_null()).then_some(Self(raw))
    }

    const fn as_ptr(&self) -> xpc_object_t {
        self.0
    }
}

impl Drop for XpcObject {
    fn drop(&mut self) {
        // SAFETY: we hold exactly one reference obtained from a create/copy call.
        unsafe { xpc_release(self.0) }
    }
}

/// A freshly allocated VM region handed to the supervisor for its reply.
struct VmRegion {
    address: mach_vm_address_t,
    size: usize,
}

impl VmRegion {
    /// Allocates `size` zero-filled bytes.
    ///
    /// Failure means the kernel could not satisfy a VM allocation; there is no
    /// degraded mode past that point, so this aborts via `handle_alloc_error`.
    fn allocate(size: usize) -> Self {
        let mut address: mach_vm_address_t = 0;
        let request_size = mach_vm_size_t::try_from(size).unwrap_or(mach_vm_size_t::MAX);
        // SAFETY: out-pointer is a valid local; the kernel chooses the address.
        let kr = unsafe { mach_vm_allocate(task_self(), &raw mut address, request_size, VM_FLAGS_ANYWHERE) };
        if kr != KERN_SUCCESS || address == 0 {
            error!(size, kern_return = kr, "Shared memory allocation failed");
            exhausted(size);
        }
        Self { address, size }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn as_mut_ptr(&self) -> *mut c_void {
        self.address as usize as *mut c_void
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is mapped, readable and `size` bytes long for as
        // long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.as_mut_ptr().cast::<u8>(), self.size) }
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        let size = mach_vm_size_t::try_from(self.size).unwrap_or(mach_vm_size_t::MAX);
        // SAFETY: address/size are exactly what mach_vm_allocate returned.
        unsafe {
            mach_vm_deallocate(task_self(), self.address, size);
        }
    }
}

fn exhausted(size: usize) -> ! {
    let layout = Layout::from_size_align(size.max(1), 4096).unwrap_or_else(|_err| Layout::new::<u8>());
    handle_alloc_error(layout)
}

fn strerror(code: c_int) -> String {
    // SAFETY: xpc_strerror returns a static string (or null for unknown codes).
    let raw = unsafe { xpc_strerror(code) };
    copy_string(raw).unwrap_or_else(|| format!("unknown error {code}"))
}

fn copy_string(raw: *const c_char) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    // SAFETY: non-null strings returned by libxpc are NUL-terminated and live
    // as long as their containing object, which outlives this copy.
    unsafe { CStr::from_ptr(raw) }.to_str().ok().map(ToOwned::to_owned)
}

fn dictionary_type() -> *const XpcType {
    // SAFETY: only the address of the type descriptor is taken.
    unsafe { &raw const _xpc_type_dictionary }
}

fn array_type() -> *const XpcType {
    // SAFETY: only the address of the type descriptor is taken.
    unsafe { &raw const _xpc_type_array }
}

fn has_type(object: xpc_object_t, expected: *const XpcType) -> bool {
    // SAFETY: callers only pass non-null objects borrowed from a live reply.
    !object.is_null() && ptr::eq(unsafe { xpc_get_type(object) }, expected)
}

/// Bootstrap port send right, held for the life of the process.
static BOOTSTRAP_PORT: OnceLock<mach_port_t> = OnceLock::new();

fn release_port(task: mach_port_t, port: mach_port_t) {
    // SAFETY: `port` is a send right this task received and no longer uses.
    unsafe {
        mach_port_deallocate(task, port);
    }
}

/// The task's registered bootstrap port.
///
/// Each lookup hands us new send-right references, so the port is looked up
/// once and every reference that is not kept is released.
fn bootstrap_port() -> Result<mach_port_t, TransportError> {
    if let Some(port) = BOOTSTRAP_PORT.get() {
        return Ok(*port);
    }

    let task = task_self();
    let mut ports: *mut mach_port_t = ptr::null_mut();
    let mut count: mach_msg_type_number_t = 0;

    // SAFETY: both out-pointers are valid locals.
    let kr = unsafe { mach_ports_lookup(task, &raw mut ports, &raw mut count) };
    if kr != KERN_SUCCESS || ports.is_null() || count == 0 {
        return Err(TransportError::PortLookup(kr));
    }

    let len = usize::try_from(count).unwrap_or(0);
    // SAFETY: the out-of-line array holds `count` ports and stays mapped
    // until the deallocation below.
    let received = unsafe { std::slice::from_raw_parts(ports, len) }.to_vec();
    let array_size = u64::from(count).saturating_mul(size_of::<mach_port_t>() as u64);
    // SAFETY: the array was vm-allocated into our task by mach_ports_lookup.
    unsafe {
        mach_vm_deallocate(task, ports as usize as mach_vm_address_t, array_size);
    }

    let Some((&port, rest)) = received.split_first() else {
        return Err(TransportError::PortLookup(kr));
    };
    for &unused in rest {
        release_port(task, unused);
    }

    match BOOTSTRAP_PORT.set(port) {
        Ok(()) => Ok(port),
        Err(ours) => {
            // Another thread stored its lookup first.
            release_port(task, ours);
            BOOTSTRAP_PORT.get().copied().ok_or(TransportError::PortLookup(kr))
        }
    }
}

/// Opens a pipe to launchd through the bootstrap port.
fn bootstrap_pipe() -> Result<XpcObject, TransportError> {
    let port = bootstrap_port()?;
    // SAFETY: plain constructor call; a null return is handled below.
    XpcObject::new(unsafe { xpc_pipe_create_from_port(port, 0) }).ok_or(TransportError::Pipe)
}

fn build_message(request: &Request) -> Result<XpcObject, TransportError> {
    // SAFETY: an empty dictionary needs no keys or values.
    let message = XpcObject::new(unsafe { xpc_dictionary_create(ptr::null(), ptr::null(), 0) })
        .ok_or_else(|| TransportError::MalformedReply("could not create request dictionary".to_owned()))?;

    // SAFETY: `message` is a live dictionary and all keys are static C strings.
    unsafe {
        xpc_dictionary_set_uint64(message.as_ptr(), c"type".as_ptr(), request.domain_type);
        xpc_dictionary_set_uint64(message.as_ptr(), c"handle".as_ptr(), request.handle);
        xpc_dictionary_set_uint64(message.as_ptr(), c"subsystem".as_ptr(), request.subsystem());
        xpc_dictionary_set_uint64(message.as_ptr(), c"routine".as_ptr(), request.routine());
    }

    if let Some(name) = request.name.as_deref() {
        let name = CString::new(name)
            .map_err(|_err| TransportError::MalformedReply("service name contains NUL".to_owned()))?;
        // SAFETY: libxpc copies the string into the dictionary.
        unsafe { xpc_dictionary_set_string(message.as_ptr(), c"name".as_ptr(), name.as_ptr()) };
    }

    Ok(message)
}

fn attach_region(message: &XpcObject, size: usize) -> VmRegion {
    let region = VmRegion::allocate(size);
    // SAFETY: the region is mapped and `size` bytes long.
    let shmem = XpcObject::new(unsafe { xpc_shmem_create(region.as_mut_ptr(), size) })
        .unwrap_or_else(|| {
            error!(size, "xpc_shmem_create failed");
            exhausted(size)
        });
    // SAFETY: the dictionary retains its own reference to `shmem`.
    unsafe { xpc_dictionary_set_value(message.as_ptr(), c"shmem".as_ptr(), shmem.as_ptr()) };
    region
}

fn read_attributes(reply: &XpcObject) -> Result<ServiceAttributes, TransportError> {
    // SAFETY (all blocks below): `reply` is live for the whole function and
    // every value obtained from it is borrowed, never released.
    let attrs = unsafe { xpc_dictionary_get_value(reply.as_ptr(), c"attrs".as_ptr()) };
    if !has_type(attrs, dictionary_type()) {
        return Err(TransportError::MalformedReply("missing attrs dictionary".to_owned()));
    }

    let program = copy_string(unsafe { xpc_dictionary_get_string(attrs, c"program".as_ptr()) });

    let mut endpoints = Vec::new();
    let list = unsafe { xpc_dictionary_get_value(attrs, c"XPCServiceEndpoints".as_ptr()) };
    if has_type(list, array_type()) {
        let count = unsafe { xpc_array_get_count(list) };
        for index in 0..count {
            let entry = unsafe { xpc_array_get_value(list, index) };
            if !has_type(entry, dictionary_type()) {
                continue;
            }
            let Some(name) =
                copy_string(unsafe { xpc_dictionary_get_string(entry, c"XPCServiceEndpointName".as_ptr()) })
            else {
                continue;
            };
            let event = unsafe { xpc_dictionary_get_bool(entry, c"XPCServiceEndpointEvent".as_ptr()) };
            endpoints.push(AttributeEndpoint { name, event });
        }
    }

    Ok(ServiceAttributes { program, endpoints })
}

/// Performs one request/reply exchange with launchd.
pub(crate) fn exchange(request: &Request, shmem_size: usize) -> Result<Reply, TransportError> {
    let message = build_message(request)?;
    let region = request
        .routine
        .uses_shared_memory()
        .then(|| attach_region(&message, shmem_size));

    let pipe = bootstrap_pipe()?;
    let mut raw_reply: xpc_object_t = ptr::null_mut();
    // SAFETY: pipe and message are live; the reply out-pointer is a valid local.
    let code = unsafe { xpc_pipe_routine(pipe.as_ptr(), message.as_ptr(), &raw mut raw_reply) };
    if code != 0 {
        return Err(TransportError::Routine {
            code,
            message: strerror(code),
        });
    }
    let reply = XpcObject::new(raw_reply)
        .ok_or_else(|| TransportError::MalformedReply("pipe routine returned no reply".to_owned()))?;

    // SAFETY: `reply` is a live dictionary.
    let error = unsafe { xpc_dictionary_get_int64(reply.as_ptr(), c"error".as_ptr()) };
    if error != 0 {
        return Err(TransportError::Supervisor {
            code: error,
            message: strerror(c_int::try_from(error).unwrap_or(c_int::MAX)),
        });
    }

    match region {
        Some(region) => {
            // SAFETY: `reply` is a live dictionary.
            let written = unsafe { xpc_dictionary_get_uint64(reply.as_ptr(), c"bytes-written".as_ptr()) };
            decode_text_payload(region.as_slice(), written).map(Reply::Text)
        }
        None => read_attributes(&reply).map(Reply::Attributes),
    }
}
