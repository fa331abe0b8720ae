//! Per-socket metadata and adaptive kernel buffer tuning.
//!
//! Writers never block on a saturated socket: when a send returns
//! `WouldBlock` with data still queued, the owning worker asks the registry
//! to grow the kernel send buffer, doubling it up to the configured cap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tuning state for one socket, guarded by its own fine-grained lock.
#[derive(Debug)]
struct SocketState {
    send_buf_size: usize,
    grow_count: u32,
    saturated: bool,
}

struct Entry {
    state: Mutex<SocketState>,
}

/// Registry of per-socket buffer metadata indexed by raw fd.
pub struct SocketRegistry {
    max_socket_buffer: usize,
    entries: Mutex<HashMap<RawFd, Arc<Entry>>>,
}

impl SocketRegistry {
    pub fn new(max_socket_buffer: usize) -> Self {
        Self {
            max_socket_buffer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Apply baseline socket options and start tracking the socket.
    pub fn setup<S: AsFd + AsRawFd>(&self, sock: &S) -> io::Result<()> {
        let sref = socket2::SockRef::from(sock);
        sref.set_nodelay(true)?;
        if let Err(e) = sref.set_keepalive(true) {
            warn!(fd = sock.as_raw_fd(), error = %e, "failed to enable keepalive");
        }
        let send_buf_size = sref.send_buffer_size().unwrap_or(0);
        self.entries.lock().insert(
            sock.as_raw_fd(),
            Arc::new(Entry {
                state: Mutex::new(SocketState {
                    send_buf_size,
                    grow_count: 0,
                    saturated: false,
                }),
            }),
        );
        Ok(())
    }

    /// Called by the owning worker when a write hit `WouldBlock` with data
    /// still queued. Doubles the kernel send buffer up to the cap.
    pub fn note_sendbuf_saturated<S: AsFd + AsRawFd>(&self, sock: &S) {
        let entry = match self.entries.lock().get(&sock.as_raw_fd()) {
            Some(e) => Arc::clone(e),
            None => return,
        };
        let mut state = entry.state.lock();
        state.saturated = true;
        if state.send_buf_size >= self.max_socket_buffer {
            return;
        }
        let target = (state.send_buf_size.max(4096) * 2).min(self.max_socket_buffer);
        let sref = socket2::SockRef::from(sock);
        match sref.set_send_buffer_size(target) {
            Ok(()) => {
                state.send_buf_size = sref.send_buffer_size().unwrap_or(target);
                state.grow_count += 1;
                debug!(
                    fd = sock.as_raw_fd(),
                    size = state.send_buf_size,
                    grows = state.grow_count,
                    "grew socket send buffer"
                );
            }
            Err(e) => warn!(fd = sock.as_raw_fd(), error = %e, "send buffer grow failed"),
        }
    }

    /// Clear the saturation flag once a write fully drained.
    pub fn note_sendbuf_drained(&self, fd: RawFd) {
        if let Some(entry) = self.entries.lock().get(&fd) {
            entry.state.lock().saturated = false;
        }
    }

    /// Stop tracking a socket; called from the teardown path.
    pub fn remove(&self, fd: RawFd) {
        self.entries.lock().remove(&fd);
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn setup_grow_and_remove() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();

        let registry = SocketRegistry::new(1024 * 1024);
        registry.setup(&client).unwrap();
        assert_eq!(registry.tracked(), 1);

        registry.note_sendbuf_saturated(&client);
        registry.note_sendbuf_drained(client.as_raw_fd());

        registry.remove(client.as_raw_fd());
        assert_eq!(registry.tracked(), 0);
    }
}
