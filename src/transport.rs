//! Serial transport loop.
//!
//! Owns the physical link to the microcontroller: finds and opens the serial
//! device, reads newline-delimited command frames, hands decoded requests to
//! the controller, and writes exactly one `STAT:` line back per valid
//! command. Malformed lines are logged and dropped without a reply, since
//! the origin command is unidentifiable.
//!
//! A link failure ends the session but not the process: the outer loop
//! reopens the port with a capped exponential backoff, so unplugging the
//! board and plugging it back in just works.

use crate::controller::ControllerHandle;
use crate::error::{Error, Result};
use picoswitch_protocol::{encode_status, parse_request};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// Maximum backoff between reopen attempts.
const MAX_BACKOFF_SECS: u64 = 30;

/// Serial transport: device selection, reconnect policy, session loop.
pub struct Transport {
    port: Option<PathBuf>,
    baud: u32,
    handle: ControllerHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl Transport {
    pub fn new(
        port: Option<PathBuf>,
        baud: u32,
        handle: ControllerHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            port,
            baud,
            handle,
            shutdown_rx,
        }
    }

    /// Run sessions until shutdown, reopening the link after each failure.
    pub async fn run(mut self) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            match self.open_link() {
                Ok((port, link)) => {
                    tracing::info!(port = %port.display(), baud = self.baud, "serial link open");
                    failures = 0;

                    let result = tokio::select! {
                        result = session(link, &self.handle) => result,
                        changed = self.shutdown_rx.changed() => {
                            if changed.is_err() || *self.shutdown_rx.borrow() {
                                tracing::info!("transport shutting down");
                                return Ok(());
                            }
                            continue;
                        }
                    };
                    if let Err(e) = result {
                        tracing::warn!(port = %port.display(), error = %e, "serial session ended");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open serial link");
                }
            }

            failures = failures.saturating_add(1);
            let backoff = Duration::from_secs(backoff_secs(failures));
            tracing::debug!(secs = backoff.as_secs(), "waiting before reopening link");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    fn open_link(&self) -> Result<(PathBuf, tokio::fs::File)> {
        let port = match &self.port {
            Some(port) => port.clone(),
            None => find_serial_port().ok_or_else(|| {
                Error::Transport("no serial port found, is the board connected?".into())
            })?,
        };
        let link = open_serial(&port, self.baud)?;
        Ok((port, link))
    }
}

/// One serial session: read frames, dispatch, reply. Returns when the link
/// fails or closes.
pub async fn session<L>(link: L, handle: &ControllerHandle) -> Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(link);
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();

    loop {
        buf.clear();
        let n = reader
            .read_line(&mut buf)
            .await
            .map_err(|e| Error::Transport(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(Error::Transport("link closed".into()));
        }

        let line = buf.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        let request = match parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                // No reply possible: the origin command is unknown.
                let e = Error::MalformedRequest(e);
                tracing::warn!(error = %e, "dropping malformed request");
                continue;
            }
        };
        tracing::debug!(line = %line, "received command");

        let reply = handle.dispatch(request).await?;
        let frame = format!("{}\n", encode_status(&reply));
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("write failed: {}", e)))?;
        tracing::debug!(line = %frame.trim_end(), "sent reply");
    }
}

/// Exponential reopen backoff: 2^n seconds, capped.
fn backoff_secs(failures: u32) -> u64 {
    let exponent = failures.min(8);
    (1u64 << exponent).min(MAX_BACKOFF_SECS)
}

/// Auto-detect the microcontroller's serial device: first of the sorted
/// `/dev/ttyACM*` entries, then `/dev/ttyUSB*`.
pub fn find_serial_port() -> Option<PathBuf> {
    find_serial_port_in(Path::new("/dev"))
}

fn find_serial_port_in(dev: &Path) -> Option<PathBuf> {
    for prefix in ["ttyACM", "ttyUSB"] {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dev)
            .ok()?
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .map(|entry| entry.path())
            .collect();
        candidates.sort();
        if let Some(port) = candidates.into_iter().next() {
            return Some(port);
        }
    }
    None
}

/// Open a serial device read/write and put it in raw mode at `baud`.
pub fn open_serial(path: &Path, baud: u32) -> Result<tokio::fs::File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::Transport(format!("failed to open {}: {}", path.display(), e)))?;
    configure_raw(&file, baud)?;
    Ok(tokio::fs::File::from_std(file))
}

/// Raw 8N1 termios setup: no echo, no line buffering, blocking single-byte
/// reads so `read_line` wakes per byte as the firmware types.
fn configure_raw(file: &std::fs::File, baud: u32) -> Result<()> {
    let fd = file.as_raw_fd();
    let speed = baud_constant(baud)?;

    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: fd is a valid open descriptor; tcgetattr fills the struct.
    let mut termios = unsafe {
        if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
            return Err(Error::Transport(format!(
                "tcgetattr failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        termios.assume_init()
    };

    unsafe {
        libc::cfmakeraw(&mut termios);
        libc::cfsetispeed(&mut termios, speed);
        libc::cfsetospeed(&mut termios, speed);
    }
    termios.c_cc[libc::VMIN] = 1;
    termios.c_cc[libc::VTIME] = 0;

    // SAFETY: termios was initialized by tcgetattr above.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
        return Err(Error::Transport(format!(
            "tcsetattr failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn baud_constant(baud: u32) -> Result<libc::speed_t> {
    let speed = match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        other => {
            return Err(Error::Config(format!("unsupported baud rate: {}", other)));
        }
    };
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::runtime::ContainerRuntime;
    use crate::stats::MemorySampler;
    use picoswitch_protocol::MemorySample;

    /// Runtime that accepts everything and never reports running.
    struct NullRuntime;

    impl ContainerRuntime for NullRuntime {
        async fn request_start(&self) -> Result<()> {
            Ok(())
        }

        async fn request_stop(&self) -> Result<()> {
            Ok(())
        }

        async fn is_running(&self) -> Result<bool> {
            Ok(false)
        }
    }

    struct FixedSampler;

    impl MemorySampler for FixedSampler {
        async fn sample(&self) -> (MemorySample, MemorySample) {
            (MemorySample::new(2048, 8192), MemorySample::new(4096, 16384))
        }
    }

    fn spawn_controller() -> (ControllerHandle, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (controller, handle) = Controller::new(
            NullRuntime,
            FixedSampler,
            Duration::from_secs(1),
            Duration::from_secs(30),
            shutdown_rx,
        );
        tokio::spawn(controller.run());
        (handle, shutdown_tx)
    }

    async fn read_reply<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_session_replies_to_status() {
        let (host_side, firmware_side) = tokio::io::duplex(1024);
        let (handle, _shutdown) = spawn_controller();
        tokio::spawn(async move {
            let _ = session(host_side, &handle).await;
        });

        let (read_half, mut write_half) = tokio::io::split(firmware_side);
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"CMD:STATUS\n").await.unwrap();
        assert_eq!(
            read_reply(&mut reader).await,
            "STAT:D|2048|8192|4096|16384\n"
        );
    }

    #[tokio::test]
    async fn test_session_one_reply_per_command() {
        let (host_side, firmware_side) = tokio::io::duplex(1024);
        let (handle, _shutdown) = spawn_controller();
        tokio::spawn(async move {
            let _ = session(host_side, &handle).await;
        });

        let (read_half, mut write_half) = tokio::io::split(firmware_side);
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"CMD:ON\r\nCMD:STATUS\n").await.unwrap();
        assert_eq!(
            read_reply(&mut reader).await,
            "STAT:S|2048|8192|4096|16384\n"
        );
        assert_eq!(
            read_reply(&mut reader).await,
            "STAT:S|2048|8192|4096|16384\n"
        );
    }

    #[tokio::test]
    async fn test_malformed_line_gets_no_reply() {
        let (host_side, firmware_side) = tokio::io::duplex(1024);
        let (handle, _shutdown) = spawn_controller();
        tokio::spawn(async move {
            let _ = session(host_side, &handle).await;
        });

        let (read_half, mut write_half) = tokio::io::split(firmware_side);
        let mut reader = BufReader::new(read_half);

        // The bad line is dropped silently; the next valid command still
        // gets its single reply, so the reply below is for CMD:STATUS.
        write_half
            .write_all(b"CMD:FOO\n\nCMD:STATUS\n")
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply.starts_with("STAT:D|"), "got {:?}", reply);

        // Close the firmware side; the session must end, not spin.
        write_half.shutdown().await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "");
    }

    #[tokio::test]
    async fn test_session_ends_on_link_close() {
        let (host_side, firmware_side) = tokio::io::duplex(64);
        let (handle, _shutdown) = spawn_controller();
        drop(firmware_side);

        let result = session(host_side, &handle).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn test_find_serial_port_prefers_acm() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB0", "ttyACM1", "ttyACM0", "sda"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(
            find_serial_port_in(dir.path()),
            Some(dir.path().join("ttyACM0"))
        );
    }

    #[test]
    fn test_find_serial_port_falls_back_to_usb() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ttyUSB2"), b"").unwrap();
        std::fs::write(dir.path().join("ttyUSB1"), b"").unwrap();
        assert_eq!(
            find_serial_port_in(dir.path()),
            Some(dir.path().join("ttyUSB1"))
        );
    }

    #[test]
    fn test_find_serial_port_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_serial_port_in(dir.path()), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(4), 16);
        assert_eq!(backoff_secs(5), 30);
        assert_eq!(backoff_secs(100), 30);
    }

    #[test]
    fn test_baud_constants() {
        assert!(baud_constant(115_200).is_ok());
        assert!(matches!(baud_constant(12_345), Err(Error::Config(_))));
    }
}
