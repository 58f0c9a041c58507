//! LD_PRELOAD interception shim (C1).
//!
//! Resolves the real libc symbols once via `dlsym(RTLD_NEXT, ...)`
//! ([`real`]), lazily builds the process-wide [`Middleware`] from
//! `IOMIDDLE_*` environment variables and a real `MPI_COMM_WORLD`, and
//! forwards each intercepted call to either the middleware or the real
//! syscall depending on whether the descriptor is currently tracked as
//! managed.
//!
//! Grounded on `original_source/src/hooklib.c`'s `HIJACK`/`HIJACK_DO` macros
//! for the dlsym-once pattern, and on `io_middle.c`'s `_iomiddle_open`/
//! `_iomiddle_close`/`_iomiddle_read`/`_iomiddle_write`/`_iomiddle_lseek`/
//! `_iomiddle_lseek64` for which libc entry points are wrapped and what they
//! delegate to [`iomiddle_core::Middleware`] for. `_myhijack_init`'s
//! getenv-driven one-shot setup is the source for [`init`]; the `tracing`
//! subscriber wiring follows `oxcrypt-fuse`'s `main.rs`.

mod real;

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use iomiddle_core::{CollectiveGroup, Config, GlobalState, Middleware, MpiGroup};
use libc::{mode_t, off64_t, off_t, size_t, ssize_t};

static MIDDLEWARE: OnceLock<Option<Middleware>> = OnceLock::new();

/// Returns the process-wide middleware, building it on first call.
/// `None` means either `IOMIDDLE_DISABLE=1` or that this process has no
/// care path configured at all (both degrade to pure pass-through).
fn middleware() -> Option<&'static Middleware> {
    MIDDLEWARE.get_or_init(init).as_ref()
}

fn init() -> Option<Middleware> {
    let config = Config::from_env().unwrap_or_else(|e| e.fatal());
    if config.disabled {
        return None;
    }

    install_tracing(&config);

    let world: Arc<dyn CollectiveGroup> = Arc::new(MpiGroup::world());
    let global = GlobalState::new(world, &config).unwrap_or_else(|e| e.fatal());

    if config.confirm_banner && global.rank == 0 {
        tracing::info!(
            target: "iomiddle::shim",
            care_path = %global.care_root,
            nprocs = global.nprocs,
            forwarders = ?global.forwarders,
            worker = global.worker_enabled,
            "iomiddle shim installed",
        );
    }

    unsafe {
        libc::atexit(shutdown_at_exit);
    }

    Some(Middleware::new(global))
}

fn install_tracing(config: &Config) {
    let base = "warn";
    let filter = match config.debug.to_filter_directive() {
        Some(extra) => format!("{base},{extra}"),
        None => base.to_string(),
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    // Installing a global subscriber from a preloaded shared object can race
    // with the host application's own `tracing` setup; `try_init` rather
    // than `init` so the shim never aborts the host over this.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

extern "C" fn shutdown_at_exit() {
    if let Some(mw) = MIDDLEWARE.get().and_then(Option::as_ref) {
        mw.shutdown(Duration::from_secs(30));
    }
}

/// `spec.md` §4.3, bullet 1: "On non-rank-0 processes, the truncate flag is
/// stripped from the open flags — only rank 0 physically truncates the
/// shared file; this prevents the N-way race where N ranks truncate the
/// file one after another, each erasing the data the others just wrote."
/// Must run *before* the real `open`/`creat`, which is why `open`/`creat`
/// below resolve the middleware and consult `is_managed_path`/`global.rank`
/// ahead of the real syscall rather than after, unlike every other
/// intercepted operation here (which only needs the middleware once a
/// descriptor already exists).
fn mask_trunc_for_non_root(mw: Option<&Middleware>, path: &[u8], trunc_requested: bool) -> bool {
    trunc_requested && mw.is_some_and(|mw| mw.is_managed_path(path) && mw.global.rank != 0)
}

/// # Safety
/// `path` must be a valid NUL-terminated C string for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    let mw = middleware();
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    // creat(path, mode) is defined as open(path, O_CREAT|O_WRONLY|O_TRUNC,
    // mode): O_TRUNC isn't a bit in `mode` to mask off, it's implied by
    // calling `creat` at all, so the non-rank-0 mask has to fall back to
    // `open()` with an explicit flag set instead of `real::real_creat()`.
    let trunc_requested = true;
    let fd = if mask_trunc_for_non_root(mw, bytes, trunc_requested) {
        unsafe { real::real_open()(path, libc::O_CREAT | libc::O_WRONLY, mode) }
    } else {
        unsafe { real::real_creat()(path, mode) }
    };
    if fd >= 0 {
        if let Some(mw) = mw {
            mw.on_open(fd, bytes, 0, mode, trunc_requested);
        }
    }
    fd
}

/// # Safety
/// `path` must be a valid NUL-terminated C string. `mode` is only meaningful
/// when `flags` includes `O_CREAT`; callers that omit it still pass
/// something in that argument slot under the C variadic calling convention,
/// so reading it unconditionally here is sound, just ignored when unused.
#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let mw = middleware();
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    let trunc_requested = (flags | mode as c_int) & libc::O_TRUNC != 0;
    let masked = mask_trunc_for_non_root(mw, bytes, trunc_requested);
    let open_flags = if masked { flags & !libc::O_TRUNC } else { flags };
    let fd = unsafe { real::real_open()(path, open_flags, mode) };
    if fd >= 0 {
        if let Some(mw) = mw {
            mw.on_open(fd, bytes, open_flags, mode, trunc_requested);
        }
    }
    fd
}

/// # Safety
/// `fd` must be a valid, currently-open file descriptor.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match middleware() {
        Some(mw) if mw.is_managed_fd(fd) => mw.on_close(fd).unwrap_or_else(|e| e.fatal()),
        _ => unsafe { real::real_close()(fd) },
    }
}

/// # Safety
/// `buf` must point to at least `count` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    match middleware() {
        Some(mw) if mw.is_managed_fd(fd) => {
            let data = unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), count) };
            match mw.on_write(fd, data) {
                Ok(n) => n as ssize_t,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(target: "iomiddle::shim", error = %e, fd, "write flush failed");
                    -1
                }
                Err(e) => e.fatal(),
            }
        }
        _ => unsafe { real::real_write()(fd, buf, count) },
    }
}

/// # Safety
/// `buf` must point to at least `count` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    match middleware() {
        Some(mw) if mw.is_managed_fd(fd) => {
            let out = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), count) };
            match mw.on_read(fd, out) {
                Ok(n) => n as ssize_t,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(target: "iomiddle::shim", error = %e, fd, "read refill failed");
                    -1
                }
                Err(e) => e.fatal(),
            }
        }
        _ => unsafe { real::real_read()(fd, buf, count) },
    }
}

fn dispatch_lseek(fd: c_int, offset: i64, whence: c_int) -> Option<i64> {
    match middleware() {
        Some(mw) if mw.is_managed_fd(fd) => match mw.on_lseek(fd, offset, whence) {
            Ok(pos) => Some(pos as i64),
            Err(e) => e.fatal(),
        },
        _ => None,
    }
}

/// # Safety
/// `fd` must be a valid, currently-open file descriptor.
#[no_mangle]
pub unsafe extern "C" fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    match dispatch_lseek(fd, offset as i64, whence) {
        Some(pos) => pos as off_t,
        None => unsafe { real::real_lseek()(fd, offset, whence) },
    }
}

/// # Safety
/// `fd` must be a valid, currently-open file descriptor.
#[no_mangle]
pub unsafe extern "C" fn lseek64(fd: c_int, offset: off64_t, whence: c_int) -> off64_t {
    match dispatch_lseek(fd, offset as i64, whence) {
        Some(pos) => pos as off64_t,
        None => unsafe { real::real_lseek64()(fd, offset, whence) },
    }
}

#[cfg(test)]
mod tests {
    use super::mask_trunc_for_non_root;

    // `mask_trunc_for_non_root` with a real `Middleware` needs a real
    // `MPI_COMM_WORLD` (see `real.rs`'s tests for the same constraint on
    // `middleware()`'s other callers), so this only exercises the
    // `mw: None` degenerate case (disabled middleware, always passes the
    // request through unmasked) plus the `trunc_requested: false` shortcut,
    // both of which are pure and don't touch MPI.
    #[test]
    fn no_middleware_never_masks() {
        assert!(!mask_trunc_for_non_root(None, b"/care/out.bin", true));
    }

    #[test]
    fn trunc_not_requested_is_never_masked() {
        assert!(!mask_trunc_for_non_root(None, b"/care/out.bin", false));
    }
}
