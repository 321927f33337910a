//! Drives the built `nbd-client` binary against a live `nbd-server` over
//! loopback. The kernel attach step itself (`ioctl`s against `/dev/nbdN`) is
//! exercised separately by `nbd-devctl`'s unit tests against
//! `RecordingDeviceControl`, since this sandbox has no NBD kernel module
//! loaded; what's tested here is everything up to that point — config
//! parsing, the TCP connect, and the JSON handshake round-trip.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

struct Server {
    child: Child,
}

impl Server {
    fn start(port: u16) -> Self {
        let config = format!(
            "[server]\naddress = \"127.0.0.1\"\nport = {port}\nmem_size_bytes = 4096\n\n[logging]\nlevel = \"error\"\n"
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("server.toml");
        std::fs::write(&config_path, config).expect("write config");

        let child = Command::new(exe_path("nbd-server"))
            .arg(&config_path)
            .spawn()
            .expect("failed to start nbd-server");
        std::thread::sleep(Duration::from_millis(200));
        std::mem::forget(dir);
        Self { child }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn exe_path(name: &str) -> PathBuf {
    let mut path = std::env::current_exe().expect("current test executable");
    path.pop();
    path.pop();
    path.push(name);
    path
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

/// The client negotiates the export over TCP and only then fails, at the
/// kernel device-open step, because this sandbox has no real `/dev/nbdN`.
#[test]
fn client_completes_handshake_before_failing_to_open_the_device() {
    let port = free_port();
    let _server = Server::start(port);

    let config = format!(
        "[nbd]\nfile = \"/dev/nbd-does-not-exist\"\nblocksize = 512\ntimeout = 5\n\n[server]\naddress = \"127.0.0.1\"\nport = {port}\n\n[backend]\nname = \"mem\"\n\n[logging]\nlevel = \"error\"\n"
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("client.toml");
    std::fs::write(&config_path, &config).expect("write config");

    let output = Command::new(exe_path("nbd-client"))
        .arg(&config_path)
        .output()
        .expect("failed to run nbd-client");

    assert!(
        !output.status.success(),
        "client must fail since /dev/nbd-does-not-exist cannot be opened"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to open device"),
        "client must get past the handshake before failing, got: {stderr}"
    );
}

/// A handshake rejection (unknown back-end) must be reported as a plain
/// error, never a panic, and never reach the device-open step.
#[test]
fn client_reports_handshake_rejection() {
    let port = free_port();
    let _server = Server::start(port);

    let config = format!(
        "[nbd]\nfile = \"/dev/nbd-does-not-exist\"\nblocksize = 512\n\n[server]\naddress = \"127.0.0.1\"\nport = {port}\n\n[backend]\nname = \"missing\"\n\n[logging]\nlevel = \"error\"\n"
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("client.toml");
    std::fs::write(&config_path, &config).expect("write config");

    let output = Command::new(exe_path("nbd-client"))
        .arg(&config_path)
        .output()
        .expect("failed to run nbd-client");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("server rejected handshake"),
        "expected a handshake rejection error, got: {stderr}"
    );
}
