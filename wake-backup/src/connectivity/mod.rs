//! Makes sure the backup server is reachable before anything touches it.
//!
//! Steps, each terminal on failure:
//! 1. loopback answers (the local network stack works)
//! 2. the host name resolves, restarting the resolver service if needed
//! 3. the host answers ping, waking it with magic packets if configured
//! 4. the ssh port accepts connections
//! 5. a non-interactive ssh login succeeds

pub mod wake;

use crate::config::Config;
use crate::executor::ssh::SshCommand;
use crate::utils::errors::ConnectivityError;
use crate::utils::retry::RetryPolicy;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub use wake::{UdpWake, WakeSender};

const RESOLVER_UNIT: &str = "systemd-resolved";

/// Individual network checks. Each returns whether the check passed.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn loopback(&self) -> bool;
    async fn resolve(&self, host: &str) -> bool;
    async fn resolver_active(&self) -> bool;
    async fn start_resolver(&self) -> bool;
    async fn echo(&self, host: &str) -> bool;
    async fn port_open(&self, host: &str, port: u16) -> bool;
    async fn authenticate(&self, login: &str, port: u16) -> Result<(), String>;
}

/// Probes backed by `ping`, `systemctl`, the system resolver and `ssh`.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl SystemProbe {
    async fn succeeds(command: &mut Command) -> bool {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn ping(host: &str, wait_secs: u32) -> bool {
        Self::succeeds(Command::new("ping").args(["-c", "1", "-W", &wait_secs.to_string(), host])).await
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn loopback(&self) -> bool {
        Self::ping("127.0.0.1", 1).await
    }

    async fn resolve(&self, host: &str) -> bool {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(host, "Name resolution failed: {}", e);
                false
            }
        }
    }

    async fn resolver_active(&self) -> bool {
        Self::succeeds(Command::new("systemctl").args(["is-active", "--quiet", RESOLVER_UNIT])).await
    }

    async fn start_resolver(&self) -> bool {
        Self::succeeds(Command::new("systemctl").args(["start", RESOLVER_UNIT])).await
    }

    async fn echo(&self, host: &str) -> bool {
        Self::ping(host, 2).await
    }

    async fn port_open(&self, host: &str, port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect((host, port));
        matches!(tokio::time::timeout(Duration::from_secs(3), connect).await, Ok(Ok(_)))
    }

    async fn authenticate(&self, login: &str, port: u16) -> Result<(), String> {
        let output = SshCommand::new(login)
            .port(port)
            .option("-oConnectTimeout=10")
            .remote_arg("true")
            .to_command()
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("cannot run ssh: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(stderr.trim().lines().last().unwrap_or("ssh failed").to_string())
        }
    }
}

/// Retry behaviour of each probe step.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub resolve: RetryPolicy,
    /// Pause between wake rounds; the attempt count comes from the config
    pub wake: RetryPolicy,
    pub service: RetryPolicy,
    pub auth: RetryPolicy,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            resolve: RetryPolicy::fixed(3, Duration::from_secs(1)),
            wake: RetryPolicy::fixed(1, Duration::from_secs(2)),
            service: RetryPolicy::fixed(3, Duration::from_secs(2)),
            auth: RetryPolicy::fixed(3, Duration::from_secs(2)),
        }
    }
}

impl Timings {
    /// Same attempt counts, no pauses.
    pub fn immediate() -> Self {
        let t = Self::default();
        Self {
            resolve: RetryPolicy::immediate(t.resolve.max_attempts),
            wake: RetryPolicy::immediate(t.wake.max_attempts),
            service: RetryPolicy::immediate(t.service.max_attempts),
            auth: RetryPolicy::immediate(t.auth.max_attempts),
        }
    }
}

pub struct Prober<'a> {
    probe: &'a dyn NetworkProbe,
    waker: &'a dyn WakeSender,
    timings: Timings,
}

impl<'a> Prober<'a> {
    pub fn new(probe: &'a dyn NetworkProbe, waker: &'a dyn WakeSender, timings: Timings) -> Self {
        Self { probe, waker, timings }
    }

    /// Succeeds only when every step passed. Local destinations pass trivially.
    pub async fn ensure_reachable(&self, cfg: &Config) -> Result<(), ConnectivityError> {
        let (Some(host), Some(login)) = (cfg.destination.host.as_deref(), cfg.destination.login()) else {
            return Ok(());
        };

        if !self.probe.loopback().await {
            return Err(ConnectivityError::LocalNetwork);
        }

        if host.parse::<Ipv4Addr>().is_err() {
            self.ensure_resolves(host).await?;
        }

        self.ensure_awake(host, cfg).await?;

        let probe = self.probe;
        let port = cfg.ssh_port;
        self.timings
            .service
            .run(|_| async move { if probe.port_open(host, port).await { Ok(()) } else { Err(()) } })
            .await
            .map_err(|_| ConnectivityError::PortClosed {
                host: host.to_string(),
                port,
            })?;

        let login_ref = login.as_str();
        self.timings
            .auth
            .run(|_| async move { probe.authenticate(login_ref, port).await })
            .await
            .map_err(|reason| ConnectivityError::Authentication {
                user: cfg.destination.user.clone().unwrap_or_default(),
                host: host.to_string(),
                reason,
            })?;

        info!(host, "Backup server is reachable");
        Ok(())
    }

    async fn ensure_resolves(&self, host: &str) -> Result<(), ConnectivityError> {
        if self.probe.resolve(host).await {
            return Ok(());
        }

        warn!(host, "Host name does not resolve");
        if !self.probe.resolver_active().await {
            info!(unit = RESOLVER_UNIT, "Resolver service is not active, starting it");
            if !self.probe.start_resolver().await {
                warn!(unit = RESOLVER_UNIT, "Failed to start resolver service");
            }
        }

        let probe = self.probe;
        self.timings
            .resolve
            .run(|_| async move { if probe.resolve(host).await { Ok(()) } else { Err(()) } })
            .await
            .map_err(|_| ConnectivityError::Resolve {
                host: host.to_string(),
            })
    }

    async fn ensure_awake(&self, host: &str, cfg: &Config) -> Result<(), ConnectivityError> {
        if self.probe.echo(host).await {
            return Ok(());
        }

        let Some(mac) = cfg.server_mac else {
            return Err(ConnectivityError::NoResponse {
                host: host.to_string(),
            });
        };

        let attempts = cfg.max_wake_attempts;
        if attempts == 0 {
            return Err(ConnectivityError::Unreachable {
                host: host.to_string(),
                attempts,
            });
        }

        info!(host, %mac, max_attempts = attempts, "Host does not answer, sending wake-on-lan packets");
        let probe = self.probe;
        let waker = self.waker;
        let mac = &mac;
        self.timings
            .wake
            .with_attempts(attempts)
            .run(|attempt| async move {
                if let Err(e) = waker.wake(mac).await {
                    warn!(attempt, "Failed to send wake packet: {}", e);
                }
                if probe.echo(host).await {
                    info!(host, attempt, "Host woke up");
                    Ok(())
                } else {
                    Err(())
                }
            })
            .await
            .map_err(|_| ConnectivityError::Unreachable {
                host: host.to_string(),
                attempts,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Destination, MacAddress};
    use crate::snapshot::SnapshotNamer;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scriptable probe; `echo` succeeds once `awake_after` echoes happened.
    pub(crate) struct FakeProbe {
        pub loopback: bool,
        pub resolves: AtomicBool,
        pub resolver_active: bool,
        pub resolver_started: AtomicBool,
        pub awake_after: Option<u32>,
        pub echoes: AtomicU32,
        pub port_open: bool,
        pub auth: Result<(), String>,
    }

    impl Default for FakeProbe {
        fn default() -> Self {
            Self {
                loopback: true,
                resolves: AtomicBool::new(true),
                resolver_active: true,
                resolver_started: AtomicBool::new(false),
                awake_after: Some(1),
                echoes: AtomicU32::new(0),
                port_open: true,
                auth: Ok(()),
            }
        }
    }

    #[async_trait]
    impl NetworkProbe for FakeProbe {
        async fn loopback(&self) -> bool {
            self.loopback
        }
        async fn resolve(&self, _host: &str) -> bool {
            self.resolves.load(Ordering::SeqCst)
        }
        async fn resolver_active(&self) -> bool {
            self.resolver_active
        }
        async fn start_resolver(&self) -> bool {
            self.resolver_started.store(true, Ordering::SeqCst);
            self.resolves.store(true, Ordering::SeqCst);
            true
        }
        async fn echo(&self, _host: &str) -> bool {
            let n = self.echoes.fetch_add(1, Ordering::SeqCst) + 1;
            self.awake_after.is_some_and(|after| n >= after)
        }
        async fn port_open(&self, _host: &str, _port: u16) -> bool {
            self.port_open
        }
        async fn authenticate(&self, _login: &str, _port: u16) -> Result<(), String> {
            self.auth.clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeWake {
        pub sent: Mutex<Vec<MacAddress>>,
    }

    #[async_trait]
    impl WakeSender for FakeWake {
        async fn wake(&self, mac: &MacAddress) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(*mac);
            Ok(())
        }
    }

    pub(crate) fn remote_config(mac: Option<&str>, max_wake_attempts: u32) -> Config {
        Config {
            source: PathBuf::from("/home/alice"),
            destination: Destination {
                user: Some("alice".into()),
                host: Some("nas.lan".into()),
                path: "backup".into(),
            },
            exclude_file: None,
            server_mac: mac.map(|m| m.parse().unwrap()),
            max_wake_attempts,
            retain_count: 5,
            snapshot_namer: SnapshotNamer::from_fn("fixed", || "2026-10-16".to_string()),
            use_suspend_lock: false,
            lock_command: "sleeplock".into(),
            ssh_port: 22,
            notify_enabled: false,
            progress: false,
            log_path: None,
            remote_log_path: None,
            dry_run: false,
        }
    }

    async fn probe_with(probe: &FakeProbe, waker: &FakeWake, cfg: &Config) -> Result<(), ConnectivityError> {
        Prober::new(probe, waker, Timings::immediate()).ensure_reachable(cfg).await
    }

    #[tokio::test]
    async fn test_reachable_host() {
        let probe = FakeProbe::default();
        let waker = FakeWake::default();
        probe_with(&probe, &waker, &remote_config(None, 5)).await.unwrap();
        assert!(waker.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_loopback_is_fatal() {
        let probe = FakeProbe { loopback: false, ..Default::default() };
        let err = probe_with(&probe, &FakeWake::default(), &remote_config(None, 5)).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::LocalNetwork));
        assert_eq!(probe.echoes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_without_mac_sends_no_wake_packets() {
        let probe = FakeProbe { awake_after: None, ..Default::default() };
        let waker = FakeWake::default();
        let err = probe_with(&probe, &waker, &remote_config(None, 5)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::NoResponse { .. }));
        assert_eq!(probe.echoes.load(Ordering::SeqCst), 1);
        assert!(waker.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wakes_sleeping_host() {
        let probe = FakeProbe { awake_after: Some(3), ..Default::default() };
        let waker = FakeWake::default();
        probe_with(&probe, &waker, &remote_config(Some("00:11:22:33:44:55"), 5)).await.unwrap();

        // first echo failed, then two wake rounds
        assert_eq!(waker.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wake_attempts_are_bounded() {
        let probe = FakeProbe { awake_after: None, ..Default::default() };
        let waker = FakeWake::default();
        let err = probe_with(&probe, &waker, &remote_config(Some("00:11:22:33:44:55"), 4)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::Unreachable { attempts: 4, .. }));
        assert_eq!(waker.sent.lock().unwrap().len(), 4);
        assert_eq!(probe.echoes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_zero_wake_attempts_never_wakes() {
        let probe = FakeProbe { awake_after: None, ..Default::default() };
        let waker = FakeWake::default();
        let err = probe_with(&probe, &waker, &remote_config(Some("00:11:22:33:44:55"), 0)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::Unreachable { attempts: 0, .. }));
        assert!(waker.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restarts_inactive_resolver() {
        let probe = FakeProbe {
            resolves: AtomicBool::new(false),
            resolver_active: false,
            ..Default::default()
        };
        probe_with(&probe, &FakeWake::default(), &remote_config(None, 5)).await.unwrap();
        assert!(probe.resolver_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let probe = FakeProbe { resolves: AtomicBool::new(false), ..Default::default() };
        let err = probe_with(&probe, &FakeWake::default(), &remote_config(None, 5)).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::Resolve { .. }));
        assert!(!probe.resolver_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ipv4_literal_skips_resolution() {
        let probe = FakeProbe { resolves: AtomicBool::new(false), ..Default::default() };
        let mut cfg = remote_config(None, 5);
        cfg.destination.host = Some("192.168.1.20".into());
        probe_with(&probe, &FakeWake::default(), &cfg).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_and_failed_auth() {
        let closed = FakeProbe { port_open: false, ..Default::default() };
        let err = probe_with(&closed, &FakeWake::default(), &remote_config(None, 5)).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::PortClosed { port: 22, .. }));

        let denied = FakeProbe { auth: Err("Permission denied (publickey)".into()), ..Default::default() };
        let err = probe_with(&denied, &FakeWake::default(), &remote_config(None, 5)).await.unwrap_err();
        assert!(err.to_string().contains("Permission denied (publickey)"));
    }

    #[tokio::test]
    async fn test_local_destination_is_not_probed() {
        let probe = FakeProbe { loopback: false, ..Default::default() };
        let mut cfg = remote_config(None, 5);
        cfg.destination = Destination { user: None, host: None, path: "/mnt/backup".into() };
        probe_with(&probe, &FakeWake::default(), &cfg).await.unwrap();
    }
}
