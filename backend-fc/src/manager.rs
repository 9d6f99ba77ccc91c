use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use backend::{Error, FunctionSpec, Result, Vm, VmState};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use vsock_host::AgentClient;

use crate::api::{self, ApiClient};
use crate::config::FirecrackerConfig;
use crate::drive::CodeDriveBuilder;
use crate::network::{self, Subnet};
use crate::paths::VmPaths;
use crate::resources::ResourcePool;
use crate::snapshot::{SnapshotMeta, SnapshotStore};

/// First guest CID handed out; 0–2 are reserved by the vsock spec and a
/// margin is left above them.
const CID_BASE: u32 = 100;

/// CID pool size.
const CID_COUNT: u32 = 4096;

/// Grace given to the guest agent's own shutdown before signalling.
const AGENT_STOP_GRACE: Duration = Duration::from_millis(500);

/// Wait after SIGTERM before escalating to SIGKILL.
const TERM_WAIT: Duration = Duration::from_secs(2);

/// Poll interval for the guest vsock socket during boot.
const VSOCK_POLL: Duration = Duration::from_millis(100);

/// Emitted when a VM disappears without a stop request, so the pool can
/// purge its index without holding a back-pointer into the manager.
#[derive(Debug, Clone)]
pub enum VmEvent {
    Exited { vm_id: String },
}

struct LiveVm {
    vm: Arc<Vm>,
    pid: u32,
    exited: watch::Receiver<bool>,
}

/// Lifecycle owner of Firecracker instances: boot, snapshot create/load,
/// stop, crash supervision.
pub struct VmManager {
    config: FirecrackerConfig,
    subnet: Subnet,
    cids: ResourcePool<u32>,
    ips: ResourcePool<String>,
    snapshots: SnapshotStore,
    drives: CodeDriveBuilder,
    live: StdMutex<HashMap<String, LiveVm>>,
    events: mpsc::UnboundedSender<VmEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<VmEvent>>>,
}

impl VmManager {
    pub fn new(config: FirecrackerConfig) -> Result<Self> {
        let subnet = Subnet::parse(&config.subnet)
            .map_err(|e| Error::FatalSetup(e.to_string()))?;

        for dir in [
            &config.socket_dir,
            &config.vsock_dir,
            &config.log_dir,
            &config.snapshot_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::FatalSetup(format!("create {}: {e}", dir.display()))
            })?;
        }

        let cids = ResourcePool::new();
        cids.fill(CID_BASE..CID_BASE + CID_COUNT);
        let ips = ResourcePool::new();
        ips.fill(subnet.hosts());

        let snapshots = SnapshotStore::new(&config.snapshot_dir);
        let drives = CodeDriveBuilder::new(&config);
        let (events, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            subnet,
            cids,
            ips,
            snapshots,
            drives,
            live: StdMutex::new(HashMap::new()),
            events,
            events_rx: StdMutex::new(Some(events_rx)),
        })
    }

    /// The event stream. Yields once; intended for the pool's purge task.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<VmEvent>> {
        lock(&self.events_rx).take()
    }

    pub fn config(&self) -> &FirecrackerConfig {
        &self.config
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    // -- boot --

    /// Boot a VM for `f` carrying `code`. Uses the function's snapshot when
    /// a complete set exists; a failed restore falls back to a cold boot.
    pub async fn create_vm(self: &Arc<Self>, f: &FunctionSpec, code: &[u8]) -> Result<Arc<Vm>> {
        let deadline = Instant::now() + self.config.boot_timeout();
        let started = Instant::now();
        let vm_id = short_vm_id();
        let mut ctx = BootCtx::new(&self.config, vm_id);

        match self.boot(&mut ctx, f, code, deadline).await {
            Ok(vm) => {
                info!(
                    id = %vm.id,
                    function = %f.name,
                    cid = vm.cid,
                    ip = %vm.guest_ip,
                    boot_ms = started.elapsed().as_millis() as u64,
                    restored = ctx.restored,
                    "vm ready"
                );
                Ok(vm)
            }
            Err(e) => {
                warn!(id = %ctx.vm_id, function = %f.name, error = %e, "boot failed, cleaning up");
                ctx.cleanup(self).await;
                Err(e)
            }
        }
    }

    async fn boot(
        self: &Arc<Self>,
        ctx: &mut BootCtx,
        f: &FunctionSpec,
        code: &[u8],
        deadline: Instant,
    ) -> Result<Arc<Vm>> {
        // CID first; everything else hangs off the VM id.
        let cid = self
            .cids
            .acquire()
            .ok_or_else(|| Error::ResourceAllocation("vsock CID pool exhausted".into()))?;
        ctx.cid = Some(cid);

        remove_stale(&ctx.paths.api_sock).await;
        remove_stale(&ctx.paths.vsock).await;

        let image_name = f.runtime_image.clone().unwrap_or_else(|| f.runtime.clone());
        let rootfs = self.config.rootfs_image(&image_name);
        if !rootfs.exists() {
            return Err(Error::FatalSetup(format!(
                "rootfs image missing: {}",
                rootfs.display()
            )));
        }

        self.drives
            .build_single(&ctx.paths.code_drive, code)
            .await
            .map_err(|e| Error::FatalSetup(format!("code drive: {e}")))?;
        ctx.code_drive_built = true;

        network::ensure_bridge(&self.config.bridge_name, &self.subnet)
            .await
            .map_err(|e| Error::FatalSetup(format!("bridge setup: {e}")))?;

        let ip = self
            .ips
            .acquire()
            .ok_or_else(|| Error::ResourceAllocation("guest IP pool exhausted".into()))?;
        ctx.ip = Some(ip.clone());

        let tap = network::tap_name(&ctx.vm_id);
        if f.isolated() {
            let policy = f.network_policy.clone().unwrap_or_default();
            let ns = network::setup_netns(
                &ctx.vm_id,
                &tap,
                &ip,
                &self.config.bridge_name,
                &self.subnet,
                &policy,
            )
            .await
            .map_err(|e| Error::FatalSetup(format!("netns setup: {e}")))?;
            ctx.netns = Some(ns);
        } else {
            network::create_tap(&tap, &self.config.bridge_name)
                .await
                .map_err(|e| Error::BootFailed(format!("tap setup: {e}")))?;
            ctx.tap = Some(tap.clone());
        }

        // A partial artifact set is garbage from a crashed snapshot write;
        // clear it before deciding how to boot.
        let have_snapshot = self.snapshots.complete(&f.id);
        if !have_snapshot && self.snapshots.exists(&f.id) {
            self.snapshots.invalidate(&f.id).await;
        }

        let child = self.spawn_firecracker(ctx).await?;
        ctx.child = Some(child);

        let api = api::client_for(&ctx.paths.api_sock);
        self.wait_for_api(ctx, &api, deadline).await?;

        let mut bindings = BootBindings {
            cid,
            ip,
            mac: network::guest_mac(&ctx.vm_id),
            vsock_path: ctx.paths.vsock.clone(),
            code_drive: ctx.paths.code_drive.clone(),
            preserve_code_drive: false,
        };

        if have_snapshot {
            match self.restore(ctx, f, &api, &tap, &mut bindings).await {
                Ok(()) => ctx.restored = true,
                Err(e) => {
                    warn!(
                        id = %ctx.vm_id,
                        function = %f.name,
                        error = %e,
                        "snapshot restore failed, wiping set and cold booting"
                    );
                    self.snapshots.invalidate(&f.id).await;

                    // The half-restored process cannot be reconfigured;
                    // replace it wholesale.
                    if let Some(child) = ctx.child.as_mut() {
                        kill_group(child);
                        let _ = child.wait().await;
                    }
                    ctx.child = None;
                    api::evict_client(&ctx.paths.api_sock);
                    remove_stale(&ctx.paths.api_sock).await;
                    remove_stale(&ctx.paths.vsock).await;
                    if let Some(extra) = ctx.extra_vsock_path.take() {
                        remove_stale(&extra).await;
                    }

                    let child = self.spawn_firecracker(ctx).await?;
                    ctx.child = Some(child);
                    let api = api::client_for(&ctx.paths.api_sock);
                    self.wait_for_api(ctx, &api, deadline).await?;

                    bindings = BootBindings {
                        cid: ctx.cid.unwrap_or(cid),
                        ip: ctx.ip.clone().unwrap_or_default(),
                        mac: network::guest_mac(&ctx.vm_id),
                        vsock_path: ctx.paths.vsock.clone(),
                        code_drive: ctx.paths.code_drive.clone(),
                        preserve_code_drive: false,
                    };
                    self.cold_configure(ctx, f, &api, &rootfs, &tap, &bindings).await?;
                }
            }
        } else {
            self.cold_configure(ctx, f, &api, &rootfs, &tap, &bindings).await?;
        }

        self.wait_for_vsock(ctx, &bindings.vsock_path, deadline).await?;

        let vm = Arc::new(Vm::new(
            ctx.vm_id.clone(),
            f.runtime.clone(),
            image_name,
            bindings.cid,
            bindings.ip.clone(),
            bindings.mac.clone(),
            ctx.tap.clone(),
            ctx.netns.clone(),
            ctx.paths.api_sock.clone(),
            bindings.vsock_path.clone(),
            bindings.code_drive.clone(),
            ctx.paths.log.clone(),
        ));
        if bindings.preserve_code_drive {
            vm.set_preserve_code_drive(true);
        }
        vm.set_state(VmState::Running);

        let Some(child) = ctx.child.take() else {
            return Err(Error::BootFailed("firecracker process vanished".into()));
        };
        let Some(pid) = child.id() else {
            return Err(Error::BootFailed("firecracker exited during boot".into()));
        };

        let (exit_tx, exit_rx) = watch::channel(false);
        lock(&self.live).insert(
            vm.id.clone(),
            LiveVm {
                vm: Arc::clone(&vm),
                pid,
                exited: exit_rx,
            },
        );
        self.spawn_supervisor(Arc::clone(&vm), child, exit_tx);

        // Ownership of every acquired resource has transferred to the VM
        // record; cleanup-on-error must no longer touch it.
        ctx.disarm();

        Ok(vm)
    }

    async fn spawn_firecracker(&self, ctx: &BootCtx) -> Result<tokio::process::Child> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.paths.log)
            .map_err(|e| Error::BootFailed(format!("open log file: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::BootFailed(format!("clone log handle: {e}")))?;

        // Inside a netns the process must be entered via `ip netns exec`.
        let mut cmd = match &ctx.netns {
            Some(ns) => {
                let mut cmd = tokio::process::Command::new("ip");
                cmd.args(["netns", "exec", ns.as_str()]);
                cmd.arg(&self.config.firecracker_bin);
                cmd
            }
            None => tokio::process::Command::new(&self.config.firecracker_bin),
        };

        cmd.arg("--api-sock")
            .arg(&ctx.paths.api_sock)
            .arg("--id")
            .arg(&ctx.vm_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| Error::BootFailed(format!("spawn firecracker: {e}")))?;
        debug!(id = %ctx.vm_id, pid = child.id(), "firecracker spawned");
        Ok(child)
    }

    async fn wait_for_api(
        &self,
        ctx: &mut BootCtx,
        api: &ApiClient,
        deadline: Instant,
    ) -> Result<()> {
        if ctx.child_exited() {
            return Err(Error::BootFailed("firecracker exited before the API socket".into()));
        }
        api.wait_for_ready(remaining(deadline))
            .await
            .map_err(|e| Error::BootFailed(format!("api socket: {e}")))?;
        if ctx.child_exited() {
            return Err(Error::BootFailed("firecracker exited during startup".into()));
        }
        Ok(())
    }

    async fn cold_configure(
        &self,
        ctx: &BootCtx,
        f: &FunctionSpec,
        api: &ApiClient,
        rootfs: &Path,
        tap: &str,
        b: &BootBindings,
    ) -> Result<()> {
        let boot_err = |e: api::ApiError| Error::BootFailed(e.to_string());
        let limits = f.resource_limits.clone().unwrap_or_default();

        api.put_logger(&ctx.paths.log).await.map_err(boot_err)?;

        let args = network::boot_args(
            &b.ip,
            &self.subnet.gateway().to_string(),
            &self.subnet.netmask().to_string(),
        );
        api.put_boot_source(&self.config.kernel_path, &args)
            .await
            .map_err(boot_err)?;

        api.put_drive("rootfs", rootfs, true, None).await.map_err(boot_err)?;
        api.put_drive(
            "code",
            &b.code_drive,
            false,
            rate_limiter(limits.disk_bw, limits.disk_iops),
        )
        .await
        .map_err(boot_err)?;
        for (i, layer) in f.layer_paths.iter().enumerate() {
            api.put_drive(&format!("layer{i}"), Path::new(layer), false, None)
                .await
                .map_err(boot_err)?;
        }

        api.put_network_interface(
            "eth0",
            &b.mac,
            tap,
            rate_limiter(limits.net_rx_bw, None),
            rate_limiter(limits.net_tx_bw, None),
        )
        .await
        .map_err(boot_err)?;

        api.put_vsock(b.cid, &b.vsock_path).await.map_err(boot_err)?;
        api.put_machine_config(f.vcpus, f.memory_mb).await.map_err(boot_err)?;
        api.start_instance().await.map_err(boot_err)?;
        Ok(())
    }

    /// Rebind the recorded snapshot identity onto this VM and load it.
    ///
    /// Firecracker baked the vsock UDS path, CID, and drive paths into the
    /// snapshot; those exact values must be claimed before `/snapshot/load`.
    /// Only the logger may be configured beforehand.
    async fn restore(
        &self,
        ctx: &mut BootCtx,
        f: &FunctionSpec,
        api: &ApiClient,
        tap: &str,
        b: &mut BootBindings,
    ) -> Result<()> {
        let load_err = |m: String| Error::SnapshotLoad(m);

        let meta = self
            .snapshots
            .get_meta(&f.id)
            .await
            .map_err(|e| load_err(format!("read meta: {e}")))?;

        if !self.cids.swap_reserved(b.cid, meta.vsock_cid) {
            return Err(load_err(format!("recorded CID {} already in use", meta.vsock_cid)));
        }
        ctx.cid = Some(meta.vsock_cid);
        b.cid = meta.vsock_cid;

        if !self.ips.swap_reserved(b.ip.clone(), meta.guest_ip.clone()) {
            return Err(load_err(format!("recorded IP {} already in use", meta.guest_ip)));
        }
        ctx.ip = Some(meta.guest_ip.clone());
        b.ip = meta.guest_ip.clone();
        b.mac = meta.guest_mac.clone();

        remove_stale(&meta.vsock_path).await;
        ctx.extra_vsock_path = Some(meta.vsock_path.clone());
        b.vsock_path = meta.vsock_path.clone();

        // The snapshot references the original code-drive path; recreate it
        // from the persistent copy.
        tokio::fs::copy(&meta.code_drive_backup, &meta.code_drive)
            .await
            .map_err(|e| load_err(format!("restore code drive: {e}")))?;
        b.code_drive = meta.code_drive.clone();
        // The restored drive path is shared snapshot state, never deleted
        // with an individual VM.
        b.preserve_code_drive = true;

        api.put_logger(&ctx.paths.log)
            .await
            .map_err(|e| load_err(format!("logger: {e}")))?;
        api.load_snapshot(
            &self.snapshots.snap_path(&f.id),
            &self.snapshots.mem_path(&f.id),
            &[("eth0".to_string(), tap.to_string())],
            true,
        )
        .await
        .map_err(|e| load_err(format!("snapshot load: {e}")))?;

        Ok(())
    }

    async fn wait_for_vsock(
        &self,
        ctx: &mut BootCtx,
        vsock_path: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let mut last_err = String::from("never attempted");
        loop {
            if ctx.child_exited() {
                return Err(Error::BootFailed("firecracker exited before the agent came up".into()));
            }
            match AgentClient::probe(vsock_path, self.config.vsock_port, VSOCK_POLL * 5).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e.to_string(),
            }
            if Instant::now() + VSOCK_POLL >= deadline {
                return Err(Error::AgentUnreachable(format!(
                    "guest agent on {} not reachable: {last_err}",
                    vsock_path.display()
                )));
            }
            sleep(VSOCK_POLL).await;
        }
    }

    // -- stop --

    /// Stop a VM and release everything it held. Unknown ids are a no-op
    /// (the supervisor may have cleaned up a crash already).
    pub async fn stop_vm(&self, id: &str) -> Result<()> {
        // Removing from the map first marks the exit as intentional for the
        // supervisor.
        let Some(entry) = lock(&self.live).remove(id) else {
            return Ok(());
        };
        let vm = entry.vm;
        info!(id = %vm.id, "stopping vm");

        let agent = AgentClient::with_max_frame(
            vm.vsock_path.clone(),
            self.config.vsock_port,
            self.config.max_vsock_frame(),
        );
        if let Err(e) = agent.stop(AGENT_STOP_GRACE).await {
            debug!(id = %vm.id, error = %e, "graceful agent stop failed");
        }

        if let Ok(pid) = i32::try_from(entry.pid) {
            let pgid = Pid::from_raw(pid);
            let _ = killpg(pgid, Signal::SIGTERM);
            let mut exited = entry.exited.clone();
            let terminated = timeout(TERM_WAIT, exited.wait_for(|v| *v)).await.is_ok();
            if !terminated {
                let _ = killpg(pgid, Signal::SIGKILL);
                let _ = timeout(TERM_WAIT, exited.wait_for(|v| *v)).await;
            }
        }

        self.release_vm_resources(&vm).await;
        vm.set_state(VmState::Stopped);
        Ok(())
    }

    async fn release_vm_resources(&self, vm: &Vm) {
        remove_stale(&vm.socket_path).await;
        remove_stale(&vm.vsock_path).await;
        if !vm.preserve_code_drive() {
            remove_stale(&vm.code_drive).await;
        }

        self.cids.release(vm.cid);
        self.ips.release(vm.guest_ip.clone());

        if vm.netns.is_some() {
            network::teardown_netns(&vm.id).await;
        } else if let Some(tap) = &vm.tap_device {
            network::delete_tap(tap).await;
        }

        api::evict_client(&vm.socket_path);
    }

    fn spawn_supervisor(
        self: &Arc<Self>,
        vm: Arc<Vm>,
        mut child: tokio::process::Child,
        exit_tx: watch::Sender<bool>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);

            // Intentional stops removed the VM from the map already; then
            // there is nothing left to do and no resource may be touched
            // twice.
            if lock(&manager.live).remove(&vm.id).is_none() {
                return;
            }

            match status {
                Ok(status) => {
                    warn!(id = %vm.id, %status, "firecracker exited unexpectedly")
                }
                Err(e) => warn!(id = %vm.id, error = %e, "firecracker wait failed"),
            }

            manager.release_vm_resources(&vm).await;
            vm.set_state(VmState::Stopped);
            let _ = manager.events.send(VmEvent::Exited {
                vm_id: vm.id.clone(),
            });
        });
    }

    // -- snapshots --

    /// Pause the VM and persist the full artifact set. The VM stays paused;
    /// call [`resume_vm`](Self::resume_vm) to continue serving.
    pub async fn create_snapshot(&self, vm: &Vm, fn_id: &str) -> Result<()> {
        let snap_err = |m: String| Error::BootFailed(m);
        let api = api::client_for(&vm.socket_path);

        api.pause_vm()
            .await
            .map_err(|e| snap_err(format!("pause: {e}")))?;
        vm.set_state(VmState::Paused);

        let snap = self.snapshots.snap_path(fn_id);
        let mem = self.snapshots.mem_path(fn_id);
        api.create_snapshot(&snap, &mem)
            .await
            .map_err(|e| snap_err(format!("snapshot create: {e}")))?;
        self.snapshots
            .sync_artifacts(fn_id)
            .await
            .map_err(|e| snap_err(format!("sync artifacts: {e}")))?;

        let backup = self.snapshots.code_backup_path(fn_id);
        tokio::fs::copy(&vm.code_drive, &backup)
            .await
            .map_err(|e| snap_err(format!("copy code drive: {e}")))?;

        let meta = SnapshotMeta {
            vsock_path: vm.vsock_path.clone(),
            vsock_cid: vm.cid,
            code_drive: vm.code_drive.clone(),
            code_drive_backup: backup,
            guest_ip: vm.guest_ip.clone(),
            guest_mac: vm.guest_mac.clone(),
        };
        self.snapshots
            .put_meta(fn_id, &meta)
            .await
            .map_err(|e| snap_err(format!("write meta: {e}")))?;

        // The live code drive now backs a snapshot; stop must not delete it.
        vm.set_preserve_code_drive(true);

        info!(id = %vm.id, function_id = %fn_id, "snapshot created");
        Ok(())
    }

    pub async fn resume_vm(&self, vm: &Vm) -> Result<()> {
        let api = api::client_for(&vm.socket_path);
        api.resume_vm()
            .await
            .map_err(|e| Error::BootFailed(format!("resume: {e}")))?;
        vm.set_state(VmState::Running);
        Ok(())
    }

    pub async fn invalidate_snapshot(&self, fn_id: &str) {
        self.snapshots.invalidate(fn_id).await;
    }

    // -- shutdown --

    /// Stop all live VMs in parallel.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<String> = lock(&self.live).keys().cloned().collect();
        info!(count = ids.len(), "stopping all vms");

        let mut set = tokio::task::JoinSet::new();
        for id in ids {
            let manager = Arc::clone(self);
            set.spawn(async move {
                if let Err(e) = manager.stop_vm(&id).await {
                    warn!(id = %id, error = %e, "stop during shutdown failed");
                }
            });
        }
        while set.join_next().await.is_some() {}

        api::sweep_stale_clients();
        info!("vm manager shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// Boot bookkeeping
// ---------------------------------------------------------------------------

/// Identity values that may be rebound by a snapshot restore.
struct BootBindings {
    cid: u32,
    ip: String,
    mac: String,
    vsock_path: PathBuf,
    code_drive: PathBuf,
    preserve_code_drive: bool,
}

/// Everything acquired during a boot attempt, so a failure at any stage
/// releases exactly what was taken.
struct BootCtx {
    vm_id: String,
    paths: VmPaths,
    cid: Option<u32>,
    ip: Option<String>,
    tap: Option<String>,
    netns: Option<String>,
    code_drive_built: bool,
    child: Option<tokio::process::Child>,
    /// Restore-rebound vsock path, removed on failure.
    extra_vsock_path: Option<PathBuf>,
    restored: bool,
}

impl BootCtx {
    fn new(config: &FirecrackerConfig, vm_id: String) -> Self {
        let paths = VmPaths::new(config, &vm_id);
        Self {
            vm_id,
            paths,
            cid: None,
            ip: None,
            tap: None,
            netns: None,
            code_drive_built: false,
            child: None,
            extra_vsock_path: None,
            restored: false,
        }
    }

    fn child_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Forget everything; ownership moved to the VM record.
    fn disarm(&mut self) {
        self.cid = None;
        self.ip = None;
        self.tap = None;
        self.netns = None;
        self.code_drive_built = false;
        self.child = None;
        self.extra_vsock_path = None;
    }

    async fn cleanup(&mut self, manager: &VmManager) {
        if let Some(child) = self.child.as_mut() {
            kill_group(child);
            let _ = child.wait().await;
        }
        self.child = None;

        remove_stale(&self.paths.api_sock).await;
        remove_stale(&self.paths.vsock).await;
        if let Some(extra) = self.extra_vsock_path.take() {
            remove_stale(&extra).await;
        }
        if self.code_drive_built {
            remove_stale(&self.paths.code_drive).await;
        }

        if let Some(cid) = self.cid.take() {
            manager.cids.release(cid);
        }
        if let Some(ip) = self.ip.take() {
            manager.ips.release(ip);
        }
        if self.netns.take().is_some() {
            network::teardown_netns(&self.vm_id).await;
        } else if let Some(tap) = self.tap.take() {
            network::delete_tap(&tap).await;
        }

        api::evict_client(&self.paths.api_sock);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn short_vm_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn remove_stale(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// SIGKILL a Firecracker's whole process group. The child is spawned with
/// `process_group(0)`, so its PGID equals its PID.
fn kill_group(child: &tokio::process::Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        // Already reaped; nothing to signal.
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed, process group likely gone");
    }
}

/// Firecracker rate-limiter object from optional bandwidth (bytes/s) and
/// ops (IOPS) budgets. `None` when neither is set.
fn rate_limiter(bandwidth: Option<u64>, ops: Option<u64>) -> Option<Value> {
    if bandwidth.is_none() && ops.is_none() {
        return None;
    }
    let mut limiter = serde_json::Map::new();
    if let Some(size) = bandwidth {
        limiter.insert("bandwidth".into(), json!({"size": size, "refill_time": 1000}));
    }
    if let Some(size) = ops {
        limiter.insert("ops".into(), json!({"size": size, "refill_time": 1000}));
    }
    Some(Value::Object(limiter))
}
