//! Process-wide snapshot of the user's login-shell environment.
//!
//! Children launched from a GUI host see a minimal `PATH` and locale; the
//! snapshot harvests the environment the user's interactive login shell
//! would have, once per process, and every spawn site layers on top of it.
//! Concurrent first accesses wait on a condition variable for the single
//! loader; a failed shell launch falls back to the current process
//! environment.

use std::{collections::HashMap, sync::OnceLock};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::AcpError;

pub type EnvMap = HashMap<String, String>;

enum CacheState {
    Empty,
    Loading,
    Ready(EnvMap),
}

struct Cache {
    state: Mutex<CacheState>,
    ready: Condvar,
}

fn cache() -> &'static Cache {
    static CACHE: OnceLock<Cache> = OnceLock::new();
    CACHE.get_or_init(|| Cache {
        state: Mutex::new(CacheState::Empty),
        ready: Condvar::new(),
    })
}

/// Async accessor; never blocks the runtime. The initial miss loads on a
/// blocking thread while concurrent callers wait for the same result.
pub async fn snapshot() -> EnvMap {
    if let Some(map) = cached() {
        return map;
    }
    match tokio::task::spawn_blocking(load_or_wait).await {
        Ok(map) => map,
        Err(error) => {
            warn!(%error, "shell environment loader task failed");
            std::env::vars().collect()
        }
    }
}

/// Blocking accessor for non-async callers. Refuses to run on a runtime
/// thread, where it could stall the event loop for the duration of a shell
/// launch.
pub fn snapshot_blocking() -> Result<EnvMap, AcpError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(AcpError::BlockingOnRuntime);
    }
    Ok(load_or_wait())
}

/// Clears the cache and re-harvests in the background. Callers observing the
/// cache mid-reload wait for the fresh result.
pub fn reload() {
    {
        let mut state = cache().state.lock();
        if matches!(*state, CacheState::Loading) {
            return;
        }
        *state = CacheState::Loading;
    }
    std::thread::spawn(|| {
        let map = harvest();
        let cache = cache();
        let mut state = cache.state.lock();
        *state = CacheState::Ready(map);
        cache.ready.notify_all();
    });
}

fn cached() -> Option<EnvMap> {
    let state = cache().state.lock();
    match &*state {
        CacheState::Ready(map) => Some(map.clone()),
        _ => None,
    }
}

fn load_or_wait() -> EnvMap {
    let cache = cache();
    let mut state = cache.state.lock();
    loop {
        match &*state {
            CacheState::Ready(map) => return map.clone(),
            CacheState::Loading => cache.ready.wait(&mut state),
            CacheState::Empty => {
                *state = CacheState::Loading;
                break;
            }
        }
    }
    drop(state);

    let map = harvest();
    let mut state = cache.state.lock();
    *state = CacheState::Ready(map.clone());
    cache.ready.notify_all();
    map
}

fn harvest() -> EnvMap {
    harvest_login_shell().unwrap_or_else(|| {
        warn!("login shell environment unavailable; using the process environment");
        std::env::vars().collect()
    })
}

fn harvest_login_shell() -> Option<EnvMap> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/zsh".to_string());
    let interactive = std::process::Command::new(&shell)
        .args(["-l", "-i", "-c", "env"])
        .output();
    let output = match interactive {
        Ok(output) if output.status.success() => output,
        // some shells refuse interactive mode without a tty
        _ => std::process::Command::new(&shell)
            .args(["-l", "-c", "env"])
            .output()
            .ok()?,
    };
    if !output.status.success() {
        return None;
    }
    Some(parse_env_lines(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_env_lines(text: &str) -> EnvMap {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let parsed = parse_env_lines("PATH=/usr/bin:/bin\nHOME=/home/u\nnot a pair\n=skipped\n");
        assert_eq!(parsed.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(parsed.get("HOME").map(String::as_str), Some("/home/u"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn values_keep_embedded_equals_signs() {
        let parsed = parse_env_lines("LS_COLORS=di=34:ln=35\n");
        assert_eq!(
            parsed.get("LS_COLORS").map(String::as_str),
            Some("di=34:ln=35")
        );
    }

    #[tokio::test]
    async fn blocking_accessor_refuses_runtime_thread() {
        assert!(matches!(
            snapshot_blocking(),
            Err(AcpError::BlockingOnRuntime)
        ));
    }

    #[tokio::test]
    async fn snapshot_provides_some_environment() {
        let map = snapshot().await;
        assert!(!map.is_empty());
    }
}
