//! Shared-object plugin loading.
//!
//! Every plugin exports the same fixed symbol table; `init`, `new_instance`
//! and `do_remap` are required, the rest optional. Libraries stay loaded for
//! the life of the registry so resolved function pointers remain valid.

use std::ffi::{c_char, c_int, c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use super::{RemapPlugin, RemapRequestInfo, RemapStatus};
use crate::core::RemapResult;
use crate::plugin_error;

const INIT_SYMBOL: &[u8] = b"remap_init";
const NEW_INSTANCE_SYMBOL: &[u8] = b"remap_new_instance";
const DO_REMAP_SYMBOL: &[u8] = b"remap_do_remap";
const DELETE_INSTANCE_SYMBOL: &[u8] = b"remap_delete_instance";
const OS_RESPONSE_SYMBOL: &[u8] = b"remap_os_response";
const DONE_SYMBOL: &[u8] = b"remap_done";

const ERRBUF_SIZE: usize = 256;

/// One-time module initialization. Non-zero aborts startup.
pub type InitFn = unsafe extern "C" fn(errbuf: *mut c_char, errbuf_size: c_int) -> c_int;
/// Per-rule instantiation: argv is the FROM URL, the TO URL, then the rule's
/// `@pparam=` values for this plugin. Non-zero aborts startup.
pub type NewInstanceFn = unsafe extern "C" fn(
    argc: c_int,
    argv: *const *const c_char,
    ih: *mut *mut c_void,
    errbuf: *mut c_char,
    errbuf_size: c_int,
) -> c_int;
/// The remap hook. `rri` points at a [`RemapRequestInfo`]; the plugin must be
/// built against the same crate version.
pub type DoRemapFn = unsafe extern "C" fn(ih: *mut c_void, rri: *mut c_void) -> c_int;
pub type DeleteInstanceFn = unsafe extern "C" fn(ih: *mut c_void);
pub type OsResponseFn = unsafe extern "C" fn(ih: *mut c_void, response_type: c_int);
pub type DoneFn = unsafe extern "C" fn();

/// A loaded plugin shared object and its resolved capability set.
pub struct PluginDso {
    path: PathBuf,
    new_instance: NewInstanceFn,
    do_remap: DoRemapFn,
    delete_instance: Option<DeleteInstanceFn>,
    os_response: Option<OsResponseFn>,
    done: Option<DoneFn>,
    _library: Library,
}

impl PluginDso {
    /// Open the shared object, resolve the symbol table and run the one-time
    /// `init`. Any failure here is fatal to the build.
    pub fn load(path: &Path) -> RemapResult<Self> {
        log::info!("Loading remap plugin {}", path.display());

        let library = unsafe { Library::new(path) }
            .map_err(|e| plugin_error!("Failed to load {}: {e}", path.display()))?;

        let init: InitFn = required_symbol(&library, path, INIT_SYMBOL)?;
        let new_instance: NewInstanceFn = required_symbol(&library, path, NEW_INSTANCE_SYMBOL)?;
        let do_remap: DoRemapFn = required_symbol(&library, path, DO_REMAP_SYMBOL)?;
        let delete_instance = optional_symbol::<DeleteInstanceFn>(&library, DELETE_INSTANCE_SYMBOL);
        let os_response = optional_symbol::<OsResponseFn>(&library, OS_RESPONSE_SYMBOL);
        let done = optional_symbol::<DoneFn>(&library, DONE_SYMBOL);

        let mut errbuf = [0u8; ERRBUF_SIZE];
        let rc = unsafe { init(errbuf.as_mut_ptr() as *mut c_char, ERRBUF_SIZE as c_int) };
        if rc != 0 {
            return Err(plugin_error!(
                "Plugin {} init failed ({rc}): {}",
                path.display(),
                errbuf_message(&errbuf)
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            new_instance,
            do_remap,
            delete_instance,
            os_response,
            done,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the per-rule instance handle shared by all requests matching
    /// that rule. A failure here is fatal to the build.
    pub fn new_instance(self: &Arc<Self>, argv: &[String]) -> RemapResult<Arc<dyn RemapPlugin>> {
        let c_args: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|_| plugin_error!("Plugin argument for {} contains NUL", self.path.display()))?;
        let ptrs: Vec<*const c_char> = c_args.iter().map(|c| c.as_ptr()).collect();

        let mut ih: *mut c_void = std::ptr::null_mut();
        let mut errbuf = [0u8; ERRBUF_SIZE];
        let rc = unsafe {
            (self.new_instance)(
                ptrs.len() as c_int,
                ptrs.as_ptr(),
                &mut ih,
                errbuf.as_mut_ptr() as *mut c_char,
                ERRBUF_SIZE as c_int,
            )
        };
        if rc != 0 {
            return Err(plugin_error!(
                "Plugin {} new_instance failed ({rc}): {}",
                self.path.display(),
                errbuf_message(&errbuf)
            ));
        }

        Ok(Arc::new(DsoInstance {
            dso: self.clone(),
            ih,
        }))
    }
}

impl Drop for PluginDso {
    fn drop(&mut self) {
        if let Some(done) = self.done {
            unsafe { done() };
        }
    }
}

fn required_symbol<T: Copy>(library: &Library, path: &Path, name: &[u8]) -> RemapResult<T> {
    unsafe { library.get::<T>(name) }
        .map(|symbol| *symbol)
        .map_err(|e| {
            plugin_error!(
                "Plugin {} is missing required symbol {}: {e}",
                path.display(),
                String::from_utf8_lossy(name)
            )
        })
}

fn optional_symbol<T: Copy>(library: &Library, name: &[u8]) -> Option<T> {
    unsafe { library.get::<T>(name) }.ok().map(|symbol| *symbol)
}

fn errbuf_message(errbuf: &[u8]) -> String {
    let end = errbuf.iter().position(|&b| b == 0).unwrap_or(errbuf.len());
    String::from_utf8_lossy(&errbuf[..end]).into_owned()
}

/// Per-rule plugin instance backed by a loaded shared object. The instance
/// handle is owned by the plugin; reentrancy on it is part of the plugin
/// contract.
pub struct DsoInstance {
    dso: Arc<PluginDso>,
    ih: *mut c_void,
}

unsafe impl Send for DsoInstance {}
unsafe impl Sync for DsoInstance {}

impl RemapPlugin for DsoInstance {
    fn do_remap(&self, rri: &mut RemapRequestInfo) -> RemapStatus {
        let code =
            unsafe { (self.dso.do_remap)(self.ih, rri as *mut RemapRequestInfo as *mut c_void) };
        RemapStatus::from_code(code)
    }

    fn os_response(&self, response_type: i32) {
        if let Some(os_response) = self.dso.os_response {
            unsafe { os_response(self.ih, response_type as c_int) };
        }
    }
}

impl Drop for DsoInstance {
    fn drop(&mut self) {
        if let Some(delete_instance) = self.dso.delete_instance {
            unsafe { delete_instance(self.ih) };
        }
    }
}
