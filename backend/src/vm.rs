use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::atomic::AtomicU64;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle state of a microVM.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Creating = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl VmState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 3, "invalid VmState: {v}");
        match v {
            0 => Self::Creating,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One live microVM.
///
/// The manager owns the record exclusively until it reaches the pool; from
/// then on it is shared (`Arc`) with one acquirer at a time. Mutable runtime
/// state lives in atomics so sharing stays lock-free.
#[derive(Debug)]
pub struct Vm {
    /// Short random id, unique per process.
    pub id: String,
    pub runtime: String,
    /// Resolved rootfs image name.
    pub runtime_image: String,
    /// Vsock context id (>= 100).
    pub cid: u32,
    pub guest_ip: String,
    pub guest_mac: String,
    /// TAP device name; `None` when the VM runs inside a netns (which owns
    /// its own TAP).
    pub tap_device: Option<String>,
    /// Network namespace name; exclusive with a host-side `tap_device`.
    pub netns: Option<String>,
    /// Firecracker API socket.
    pub socket_path: PathBuf,
    /// Vsock multiplexer socket.
    pub vsock_path: PathBuf,
    pub code_drive: PathBuf,
    pub log_path: PathBuf,
    pub created_at: SystemTime,
    state: AtomicU8,
    /// Unix millis; only moves forward.
    last_used_ms: AtomicU64,
    preserve_code_drive: AtomicBool,
}

impl Vm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        runtime: String,
        runtime_image: String,
        cid: u32,
        guest_ip: String,
        guest_mac: String,
        tap_device: Option<String>,
        netns: Option<String>,
        socket_path: PathBuf,
        vsock_path: PathBuf,
        code_drive: PathBuf,
        log_path: PathBuf,
    ) -> Self {
        Self {
            id,
            runtime,
            runtime_image,
            cid,
            guest_ip,
            guest_mac,
            tap_device,
            netns,
            socket_path,
            vsock_path,
            code_drive,
            log_path,
            created_at: SystemTime::now(),
            state: AtomicU8::new(VmState::Creating as u8),
            last_used_ms: AtomicU64::new(now_ms()),
            preserve_code_drive: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: VmState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// CAS transition. Returns `false` if the current state is not `from`.
    pub fn transition(&self, from: VmState, to: VmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record use now. `last_used` never moves backwards.
    pub fn touch(&self) {
        self.last_used_ms.fetch_max(now_ms(), Ordering::AcqRel);
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    /// Time since last use.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_used_ms()))
    }

    pub fn preserve_code_drive(&self) -> bool {
        self.preserve_code_drive.load(Ordering::Acquire)
    }

    /// Mark the code drive as referenced by a snapshot so stop keeps it.
    pub fn set_preserve_code_drive(&self, preserve: bool) {
        self.preserve_code_drive.store(preserve, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Vm {
        Vm::new(
            "ab12cd34".into(),
            "python".into(),
            "python.ext4".into(),
            100,
            "172.30.0.2".into(),
            "02:FC:00:aa:bb:cc".into(),
            Some("nova-ab12cd".into()),
            None,
            "/tmp/ab12cd34.sock".into(),
            "/tmp/ab12cd34.vsock".into(),
            "/tmp/ab12cd34-code.ext4".into(),
            "/tmp/ab12cd34.log".into(),
        )
    }

    #[test]
    fn starts_creating() {
        let vm = vm();
        assert_eq!(vm.state(), VmState::Creating);
        assert!(!vm.preserve_code_drive());
    }

    #[test]
    fn transition_checks_current_state() {
        let vm = vm();
        assert!(vm.transition(VmState::Creating, VmState::Running));
        assert_eq!(vm.state(), VmState::Running);
        assert!(!vm.transition(VmState::Creating, VmState::Running));
        assert!(vm.transition(VmState::Running, VmState::Stopped));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let vm = vm();
        let before = vm.last_used_ms();
        vm.touch();
        assert!(vm.last_used_ms() >= before);
        // Manual regression: a stale store cannot rewind via touch.
        vm.last_used_ms.store(u64::MAX, Ordering::Release);
        vm.touch();
        assert_eq!(vm.last_used_ms(), u64::MAX);
    }

    #[test]
    fn preserve_flag_round_trip() {
        let vm = vm();
        vm.set_preserve_code_drive(true);
        assert!(vm.preserve_code_drive());
    }

    #[test]
    fn state_display() {
        assert_eq!(VmState::Creating.to_string(), "creating");
        assert_eq!(VmState::Stopped.to_string(), "stopped");
    }
}
