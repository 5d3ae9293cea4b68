use anyhow::{Context, Result};
use std::io;

fn open_files_limit() -> Result<libc::rlimit> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error()).context("getrlimit(RLIMIT_NOFILE)");
    }
    Ok(limit)
}

/// Lift the soft open files limit to the hard one, returning the limit now in effect
pub(crate) fn raise_open_files_limit() -> Result<u64> {
    let limit = open_files_limit()?;
    if limit.rlim_cur >= limit.rlim_max {
        return Ok(limit.rlim_cur as u64);
    }

    let raised = libc::rlimit {
        rlim_cur: limit.rlim_max,
        rlim_max: limit.rlim_max,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
        return Err(io::Error::last_os_error()).context(format!("raising open files limit from {} to {}", limit.rlim_cur, limit.rlim_max));
    }

    log::debug!("Raised open files limit from {} to {}", limit.rlim_cur, raised.rlim_cur);
    Ok(raised.rlim_cur as u64)
}

/// Every agent connection holds a descriptor, so the limit is raised before the runtime exists
pub(crate) fn prepare_tokio_runtime(threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let open_files = raise_open_files_limit().context("raising open files limit")?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.thread_name("meshctrl-worker").enable_all().build().context("building tokio runtime")?;

    log::info!(
        "Runtime with {} worker threads, {} open files allowed",
        threads.map_or_else(|| "default".to_string(), |threads| threads.to_string()),
        open_files
    );

    Ok(runtime)
}
