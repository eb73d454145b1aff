//! iSCSI target server
//!
//! Owns the listening socket and the state shared by every session: the
//! engine configuration, the execution backend, the timer thread and the
//! session registry. Each accepted connection runs its login on a short
//! lived thread and is then handed to the engine.

use crate::backend::{BlockDeviceBackend, ExecutionBackend};
use crate::config::TargetConfig;
use crate::error::{IscsiError, IscsiResult};
use crate::lifecycle;
use crate::login;
use crate::registry::{SessionRegistry, TargetEntry};
use crate::scsi::ScsiBlockDevice;
use crate::session::Session;
use crate::timer::TimerService;
use log::{debug, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// State shared by every session of one target
pub(crate) struct TargetContext {
    pub config: TargetConfig,
    pub backend: Arc<dyn ExecutionBackend>,
    pub timers: TimerService,
    pub portal_group_tag: u16,
}

impl TargetContext {
    pub(crate) fn new(config: TargetConfig, backend: Arc<dyn ExecutionBackend>, portal_group_tag: u16) -> Self {
        TargetContext {
            config,
            backend,
            timers: TimerService::new(),
            portal_group_tag,
        }
    }
}

/// iSCSI target server
pub struct IscsiTarget {
    bind_addr: String,
    target_name: String,
    ctx: Arc<TargetContext>,
    registry: Arc<SessionRegistry>,
}

impl IscsiTarget {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder {
        IscsiTargetBuilder::new()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run the target on the current thread until the listener fails
    pub fn run(self) -> IscsiResult<()> {
        self.start()?.join()
    }

    /// Bind the listener and accept connections on a background thread
    pub fn start(self) -> IscsiResult<RunningTarget> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("iSCSI target {} listening on {}", self.target_name, local_addr);

        self.registry.add_target(TargetEntry {
            name: self.target_name.clone(),
            portals: vec![format!("{},{}", local_addr, self.ctx.portal_group_tag)],
        });

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.registry);
        let flag = Arc::clone(&stop);
        let listener_thread = thread::Builder::new()
            .name("iscsi-listener".into())
            .spawn(move || accept_loop(listener, ctx, registry, flag))?;

        Ok(RunningTarget {
            local_addr,
            target_name: self.target_name,
            ctx: self.ctx,
            registry: self.registry,
            stop,
            listener: Some(listener_thread),
        })
    }
}

fn accept_loop(
    listener: TcpListener,
    ctx: Arc<TargetContext>,
    registry: Arc<SessionRegistry>,
    stop: Arc<AtomicBool>,
) -> IscsiResult<()> {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                if let Err(e) = spawn_login(stream, &ctx, &registry) {
                    warn!("could not start login for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("accept failed: {}", e);
                return Err(e.into());
            }
        }
    }
    debug!("listener stopped");
    Ok(())
}

fn spawn_login(stream: TcpStream, ctx: &Arc<TargetContext>, registry: &Arc<SessionRegistry>) -> IscsiResult<()> {
    stream.set_nonblocking(false)?;
    let ctx = Arc::clone(ctx);
    let registry = Arc::clone(registry);
    thread::Builder::new().name("iscsi-login".into()).spawn(move || {
        if let Err(e) = login::handle_new_connection(stream, ctx, registry) {
            debug!("login failed: {}", e);
        }
    })?;
    Ok(())
}

/// A target accepting connections
pub struct RunningTarget {
    local_addr: SocketAddr,
    target_name: String,
    ctx: Arc<TargetContext>,
    registry: Arc<SessionRegistry>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<IscsiResult<()>>>,
}

impl RunningTarget {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.sessions()
    }

    /// Ask the initiator of session `tsih` to log out
    ///
    /// Connections are dropped if it does not comply within the configured
    /// async logout timeout.
    pub fn request_logout(&self, tsih: u16) -> bool {
        match self.registry.find(tsih) {
            Some(sess) => lifecycle::request_logout(&sess),
            None => false,
        }
    }

    /// Wait for the listener thread to exit
    pub fn join(mut self) -> IscsiResult<()> {
        match self.listener.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| IscsiError::session("listener thread panicked"))?,
            None => Ok(()),
        }
    }

    /// Stop accepting, ask every session to log out and free what remains
    pub fn shutdown(mut self) -> IscsiResult<()> {
        info!("shutting down target {}", self.target_name);
        self.stop.store(true, Ordering::SeqCst);
        let result = match self.listener.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| IscsiError::session("listener thread panicked"))
                .and_then(|r| r),
            None => Ok(()),
        };

        let sessions = self.registry.sessions();
        let asked = sessions
            .iter()
            .filter(|s| !s.is_discovery() && lifecycle::request_logout(s))
            .count();
        if asked > 0 {
            let deadline = Instant::now() + self.ctx.config.logout_timeout;
            while !self.registry.is_empty() && Instant::now() < deadline {
                thread::sleep(ACCEPT_POLL);
            }
        }
        for sess in self.registry.sessions() {
            lifecycle::free_session(&sess);
        }
        self.registry.remove_target(&self.target_name);
        self.ctx.timers.shutdown();
        result
    }
}

impl Drop for RunningTarget {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn valid_node_name(name: &str) -> bool {
    ["iqn.", "eui.", "naa."].iter().any(|p| name.starts_with(p)) && !name.chars().any(char::is_whitespace)
}

/// Builder for configuring an iSCSI target
pub struct IscsiTargetBuilder {
    bind_addr: Option<String>,
    target_name: Option<String>,
    portal_group_tag: u16,
    config: TargetConfig,
    registry: Option<Arc<SessionRegistry>>,
}

impl IscsiTargetBuilder {
    fn new() -> Self {
        Self {
            bind_addr: None,
            target_name: None,
            portal_group_tag: 1,
            config: TargetConfig::default(),
            registry: None,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Set the iSCSI target name (iqn., eui. or naa. format)
    ///
    /// Example: iqn.2026-10.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    pub fn portal_group_tag(mut self, tag: u16) -> Self {
        self.portal_group_tag = tag;
        self
    }

    pub fn config(mut self, config: TargetConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a registry with other targets; SendTargets lists them all
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the target over a block device run by the reference backend
    pub fn build<D: ScsiBlockDevice + 'static>(self, device: D) -> IscsiResult<IscsiTarget> {
        let backend = BlockDeviceBackend::new(device)?;
        self.build_with_backend(Arc::new(backend))
    }

    pub fn build_with_backend(self, backend: Arc<dyn ExecutionBackend>) -> IscsiResult<IscsiTarget> {
        let bind_addr = self.bind_addr.unwrap_or_else(|| "0.0.0.0:3260".to_string());
        let target_name = self
            .target_name
            .unwrap_or_else(|| "iqn.2026-10.local:storage.default".to_string());
        if !valid_node_name(&target_name) {
            return Err(IscsiError::config(format!(
                "target name {} must be in iqn., eui. or naa. format",
                target_name
            )));
        }
        self.config.validate()?;

        Ok(IscsiTarget {
            bind_addr,
            target_name,
            ctx: Arc::new(TargetContext::new(self.config, backend, self.portal_group_tag)),
            registry: self.registry.unwrap_or_else(|| Arc::new(SessionRegistry::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::ScsiBlockDevice;

    struct NullDisk;

    impl ScsiBlockDevice for NullDisk {
        fn read(&self, _lba: u64, blocks: u32, block_size: u32) -> IscsiResult<Vec<u8>> {
            Ok(vec![0; (blocks * block_size) as usize])
        }

        fn write(&mut self, _lba: u64, _data: &[u8], _block_size: u32) -> IscsiResult<()> {
            Ok(())
        }

        fn capacity(&self) -> u64 {
            64
        }

        fn block_size(&self) -> u32 {
            512
        }
    }

    #[test]
    fn test_node_names() {
        assert!(valid_node_name("iqn.2026-10.local:disk"));
        assert!(valid_node_name("eui.02004567A425678D"));
        assert!(valid_node_name("naa.52004567BA64678D"));
        assert!(!valid_node_name("disk1"));
        assert!(!valid_node_name("iqn.2026-10.local: disk"));
    }

    #[test]
    fn test_builder_rejects_bad_name() {
        let result = IscsiTarget::builder().target_name("storage").build(NullDisk);
        assert!(matches!(result, Err(IscsiError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let config = TargetConfig {
            default_erl: 3,
            ..TargetConfig::default()
        };
        let result = IscsiTarget::builder().config(config).build(NullDisk);
        assert!(matches!(result, Err(IscsiError::Config(_))));
    }

    #[test]
    fn test_start_registers_portal() {
        let target = IscsiTarget::builder()
            .bind_addr("127.0.0.1:0")
            .target_name("iqn.2026-10.test:portal")
            .portal_group_tag(7)
            .build(NullDisk)
            .unwrap();
        let running = target.start().unwrap();
        let entries = running.registry().targets();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].portals[0], format!("{},7", running.local_addr()));
        let registry = Arc::clone(running.registry());
        running.shutdown().unwrap();
        assert!(!registry.has_target("iqn.2026-10.test:portal"));
    }
}
