//! libvirt C API, loaded with `dlopen`.
//!
//! Loading at runtime keeps the binary buildable and testable on hosts
//! without libvirt development files; only the sidecar container needs
//! `libvirt.so.0`.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Shared object name of the libvirt client library.
const LIBVIRT_SONAME: &str = "libvirt.so.0";

pub(crate) type VirConnectPtr = *mut c_void;
pub(crate) type VirDomainPtr = *mut c_void;

/// `virConnectDomainEventCallback` (lifecycle).
pub(crate) type LifecycleCallback =
    unsafe extern "C" fn(VirConnectPtr, VirDomainPtr, c_int, c_int, *mut c_void) -> c_int;
/// `virConnectDomainEventGenericCallback`; every typed callback is registered
/// through this signature.
pub(crate) type GenericCallback = unsafe extern "C" fn(VirConnectPtr, VirDomainPtr, *mut c_void);
/// `virConnectCloseFunc`
pub(crate) type CloseCallback = unsafe extern "C" fn(VirConnectPtr, c_int, *mut c_void);
/// `virFreeCallback`
pub(crate) type FreeCallback = unsafe extern "C" fn(*mut c_void);

/// `VIR_DOMAIN_EVENT_ID_LIFECYCLE`
pub(crate) const EVENT_ID_LIFECYCLE: c_int = 0;
/// `VIR_ERR_NO_DOMAIN`
pub(crate) const ERR_NO_DOMAIN: c_int = 42;
/// `VIR_ERR_OPERATION_INVALID`
pub(crate) const ERR_OPERATION_INVALID: c_int = 55;

/// Leading fields of `virError`; only read through a pointer.
#[repr(C)]
pub(crate) struct VirError {
    code: c_int,
    _domain: c_int,
    message: *const c_char,
}

/// Function pointers into libvirt.
#[allow(missing_docs)]
pub(crate) struct VirtApi {
    _handle: *mut c_void,
    pub event_register_default_impl: unsafe extern "C" fn() -> c_int,
    pub event_run_default_impl: unsafe extern "C" fn() -> c_int,
    pub connect_open: unsafe extern "C" fn(*const c_char) -> VirConnectPtr,
    pub connect_close: unsafe extern "C" fn(VirConnectPtr) -> c_int,
    pub connect_is_alive: unsafe extern "C" fn(VirConnectPtr) -> c_int,
    pub connect_register_close_callback:
        unsafe extern "C" fn(VirConnectPtr, CloseCallback, *mut c_void, Option<FreeCallback>) -> c_int,
    pub connect_unregister_close_callback:
        unsafe extern "C" fn(VirConnectPtr, CloseCallback) -> c_int,
    pub domain_event_register_any: unsafe extern "C" fn(
        VirConnectPtr,
        VirDomainPtr,
        c_int,
        GenericCallback,
        *mut c_void,
        Option<FreeCallback>,
    ) -> c_int,
    pub domain_event_deregister_any: unsafe extern "C" fn(VirConnectPtr, c_int) -> c_int,
    pub domain_lookup_by_name: unsafe extern "C" fn(VirConnectPtr, *const c_char) -> VirDomainPtr,
    pub domain_get_name: unsafe extern "C" fn(VirDomainPtr) -> *const c_char,
    pub domain_get_state:
        unsafe extern "C" fn(VirDomainPtr, *mut c_int, *mut c_int, c_uint) -> c_int,
    pub domain_get_xml_desc: unsafe extern "C" fn(VirDomainPtr, c_uint) -> *mut c_char,
    pub domain_free: unsafe extern "C" fn(VirDomainPtr) -> c_int,
    pub get_last_error: unsafe extern "C" fn() -> *mut VirError,
}

// SAFETY: the handle is never closed and the function pointers are plain
// code addresses; libvirt's client API is thread-safe.
unsafe impl Send for VirtApi {}
unsafe impl Sync for VirtApi {}

static API: OnceLock<std::result::Result<VirtApi, String>> = OnceLock::new();

/// The process-wide libvirt API, loaded on first use.
pub(crate) fn api() -> Result<&'static VirtApi> {
    API.get_or_init(|| unsafe { VirtApi::load() })
        .as_ref()
        .map_err(|e| Error::HypervisorUnavailable(e.clone()))
}

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread-local, NUL-terminated string or NULL.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().to_string()
        }
    }
}

impl VirtApi {
    /// Load libvirt and resolve every symbol used by this crate.
    ///
    /// # Safety
    ///
    /// The library found under [`LIBVIRT_SONAME`] must be libvirt; symbols are
    /// transmuted to the signatures declared above.
    unsafe fn load() -> std::result::Result<Self, String> {
        let soname = CString::new(LIBVIRT_SONAME).map_err(|_| "invalid library name")?;
        let handle = libc::dlopen(soname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            return Err(format!("failed to load {}: {}", LIBVIRT_SONAME, dl_error()));
        }

        macro_rules! load_sym {
            ($name:ident) => {{
                let sym_name = CString::new(stringify!($name)).map_err(|_| "invalid symbol name")?;
                let sym = libc::dlsym(handle, sym_name.as_ptr());
                if sym.is_null() {
                    libc::dlclose(handle);
                    return Err(format!("symbol not found: {}", stringify!($name)));
                }
                #[allow(clippy::missing_transmute_annotations)]
                std::mem::transmute(sym)
            }};
        }

        Ok(Self {
            _handle: handle,
            event_register_default_impl: load_sym!(virEventRegisterDefaultImpl),
            event_run_default_impl: load_sym!(virEventRunDefaultImpl),
            connect_open: load_sym!(virConnectOpen),
            connect_close: load_sym!(virConnectClose),
            connect_is_alive: load_sym!(virConnectIsAlive),
            connect_register_close_callback: load_sym!(virConnectRegisterCloseCallback),
            connect_unregister_close_callback: load_sym!(virConnectUnregisterCloseCallback),
            domain_event_register_any: load_sym!(virConnectDomainEventRegisterAny),
            domain_event_deregister_any: load_sym!(virConnectDomainEventDeregisterAny),
            domain_lookup_by_name: load_sym!(virDomainLookupByName),
            domain_get_name: load_sym!(virDomainGetName),
            domain_get_state: load_sym!(virDomainGetState),
            domain_get_xml_desc: load_sym!(virDomainGetXMLDesc),
            domain_free: load_sym!(virDomainFree),
            get_last_error: load_sym!(virGetLastError),
        })
    }

    /// Code and message of the calling thread's last libvirt error.
    pub(crate) fn last_error(&self) -> (c_int, String) {
        // SAFETY: virGetLastError returns NULL or a pointer to thread-local
        // error storage that stays valid until the next libvirt call here.
        unsafe {
            let err = (self.get_last_error)();
            if err.is_null() {
                return (0, "unknown libvirt error".to_string());
            }
            let message = if (*err).message.is_null() {
                "unknown libvirt error".to_string()
            } else {
                CStr::from_ptr((*err).message).to_string_lossy().to_string()
            };
            ((*err).code, message)
        }
    }
}
