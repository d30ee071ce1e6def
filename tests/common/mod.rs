#![allow(dead_code)]

use catalog_router::RouterConfig;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const ROOT_PASSWORD: &str = "sandbox";

pub struct ServerGuard {
    child: Child,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Starts a sandbox with a `wordpress` database in every catalog and the
/// given tenant catalogs.
pub fn spawn_sandbox(catalogs: &[&str]) -> anyhow::Result<(ServerGuard, SocketAddr)> {
    let bin = env!("CARGO_BIN_EXE_catalog-sandbox");

    let mut args = vec![
        "--listen".to_string(),
        "127.0.0.1:0".to_string(),
        "--root-password".to_string(),
        ROOT_PASSWORD.to_string(),
        "--database".to_string(),
        "wordpress".to_string(),
    ];
    for catalog in catalogs {
        args.push("--catalog".to_string());
        args.push(catalog.to_string());
    }

    let mut child = Command::new(bin)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture sandbox stderr"))?;

    let (addr_tx, addr_rx) = mpsc::channel::<SocketAddr>();
    let stderr_thread = thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while reader
            .read_line(&mut line)
            .ok()
            .filter(|n| *n > 0)
            .is_some()
        {
            if let Some(rest) = line.strip_prefix("catalog-sandbox listening on ") {
                if let Ok(addr) = rest.trim().parse::<SocketAddr>() {
                    let _ = addr_tx.send(addr);
                }
            }
            eprint!("{}", line);
            line.clear();
        }
    });

    let addr = match addr_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(addr) => addr,
        Err(err) => {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("sandbox exited before reporting listen address: {status} ({err})");
            }
            anyhow::bail!("timed out waiting for sandbox listen address: {err}");
        }
    };

    Ok((
        ServerGuard {
            child,
            stderr_thread: Some(stderr_thread),
        },
        addr,
    ))
}

pub fn router_config(addr: SocketAddr) -> RouterConfig {
    RouterConfig {
        host: format!("127.0.0.1:{}", addr.port()),
        user: "root".into(),
        password: ROOT_PASSWORD.into(),
        allow_failure_return: true,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}
