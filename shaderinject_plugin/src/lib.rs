//! Replaces the shaders and root signatures a D3D12 host builds its pipelines from.
//!
//! Loaded into the host process, the plugin resolves the code locations it needs by
//! signature, installs its hooks in one transaction and from then on sees every pipeline
//! the host loads, creates and stores.

mod config;
pub mod d3d;
mod debug_markers;
#[cfg(target_arch = "x86_64")]
mod hooks;
pub mod intercept;
mod live_update;
mod logging;
pub mod renderer;
pub mod replacement;

use std::{
    path::Path,
    sync::{Arc, OnceLock},
};

use anyhow::{anyhow, Context, Result};
use shaderinject::{offsets::Signatures, MemoryRegion, SignatureRegistry};

use crate::{
    config::Config,
    intercept::{Interceptor, Settings},
    replacement::{FilePolicy, ReplacementPolicy},
};

static INTERCEPTOR: OnceLock<Interceptor> = OnceLock::new();
#[cfg(all(windows, target_arch = "x86_64"))]
static HOOKS: OnceLock<shaderinject::HookEngine> = OnceLock::new();

#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn interceptor() -> Option<&'static Interceptor> {
    INTERCEPTOR.get()
}

#[cfg(windows)]
mod entry {
    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::HMODULE,
            System::{
                LibraryLoader::{
                    GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                },
                SystemServices::*,
                Threading::{GetCurrentThread, QueueUserAPC},
            },
        },
    };

    #[no_mangle]
    #[allow(non_snake_case, unused_variables)]
    extern "system" fn DllMain(dll_module: HMODULE, call_reason: u32, _: *mut ()) -> bool {
        unsafe {
            match call_reason {
                DLL_PROCESS_ATTACH => {
                    QueueUserAPC(Some(init), GetCurrentThread(), 0);
                }
                DLL_PROCESS_DETACH => (),
                _ => (),
            }

            true
        }
    }

    unsafe extern "system" fn init(_: usize) {
        let module = match plugin_path() {
            Ok(module) => module,
            Err(_) => return,
        };
        if let Err(e) = super::setup(&module) {
            tracing::error!("{e:#}");
        }
    }

    /// Path of this plugin's own module.
    fn plugin_path() -> windows::core::Result<std::path::PathBuf> {
        let mut module = HMODULE::default();
        unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(init as usize as *const u16),
                &mut module,
            )?;
        }
        let mut buffer = vec![0u16; 1024];
        let len = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
        Ok(String::from_utf16_lossy(&buffer[..len]).into())
    }
}

fn setup(module: &Path) -> Result<()> {
    let dir = module.parent().context("could not find plugin directory")?;

    let log_guard = logging::setup_logging(dir)?;
    std::mem::forget(log_guard);

    tracing::info!(
        "{} {} loaded",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load(&Config::path_for_module(module))?;
    let working_dir = std::env::current_dir().context("could not read working directory")?;
    INTERCEPTOR
        .set(build_interceptor(&config, &working_dir))
        .map_err(|_| anyhow!("plugin initialized twice"))?;

    let image = MemoryRegion::main_module()?;
    let mut registry = SignatureRegistry::new();
    let signatures = Signatures::register(&mut registry);

    tracing::info!("starting scan");
    let report = registry.resolve_all(&image);
    report.ensure_complete()?;
    tracing::info!("resolved {} signatures", report.total());

    install_hooks(&signatures, config.insert_debug_markers())
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn install_hooks(signatures: &Signatures, insert_debug_markers: bool) -> Result<()> {
    let mut engine = shaderinject::HookEngine::native();
    unsafe { hooks::install(&mut engine, signatures, insert_debug_markers) }?;
    HOOKS
        .set(engine)
        .map_err(|_| anyhow!("hooks installed twice"))
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn install_hooks(_: &Signatures, _: bool) -> Result<()> {
    anyhow::bail!("hooks are only available on 64-bit Windows")
}

fn build_interceptor(config: &Config, working_dir: &Path) -> Interceptor {
    let policy: Arc<dyn ReplacementPolicy> = match config.dump_path() {
        Some(path) => {
            tracing::info!("Dumping shaders to {}", path.display());
            Arc::new(FilePolicy::dump(path))
        }
        None => Arc::new(FilePolicy::replace(FilePolicy::default_root(working_dir))),
    };
    let settings = Settings {
        allow_live_updates: config.allow_live_updates(),
        insert_debug_markers: config.insert_debug_markers(),
    };
    Interceptor::new(policy, settings, Box::new(live_update::spawn))
}
