//! Runs the async entry point.
//!
//! On macOS the main thread must service the main run loop so that
//! Virtualization.framework calls dispatched to the main queue execute. The
//! tokio runtime lives on a worker thread there, which ends the process when
//! the command finishes.

use std::future::Future;

fn block_on<F>(fut: F) -> i32
where
    F: Future<Output = anyhow::Result<()>>,
{
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return 1;
        }
    };
    match runtime.block_on(fut) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

#[cfg(target_os = "macos")]
mod runloop {
    use std::ffi::c_void;

    #[link(name = "CoreFoundation", kind = "framework")]
    unsafe extern "C" {
        static kCFRunLoopDefaultMode: *const c_void;
        fn CFRunLoopRunInMode(
            mode: *const c_void,
            seconds: f64,
            return_after_source_handled: bool,
        ) -> i32;
    }

    /// Services the current thread's run loop forever.
    pub fn run_forever() -> ! {
        loop {
            // SAFETY: the mode is an immutable framework constant.
            unsafe { CFRunLoopRunInMode(kCFRunLoopDefaultMode, 1.0, false) };
        }
    }
}

#[cfg(target_os = "macos")]
pub fn run<F>(fut: F) -> i32
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name("burrow-runtime".to_string())
        .spawn::<_, ()>(move || std::process::exit(block_on(fut)));
    if let Err(e) = spawned {
        eprintln!("Error: failed to spawn runtime thread: {e}");
        return 1;
    }
    runloop::run_forever()
}

#[cfg(not(target_os = "macos"))]
pub fn run<F>(fut: F) -> i32
where
    F: Future<Output = anyhow::Result<()>>,
{
    block_on(fut)
}
