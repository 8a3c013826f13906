//! TCP sockets (§4.6): `listen`/`accept`/`connect`/`send`/`recv`/`close`.
//! Each handle shares a `(Mutex<Tcb>, Condvar)` with the socket table; the
//! condvar is notified whenever the table's receive path mutates the TCB,
//! which is how the suspension points below wake up.

use crate::addr::IpAddr;
use crate::error::SocketError;
use crate::socket::key::SocketKey;
use crate::socket::table::{SocketTable, TcbHandle};
use crate::socket::Transport;
use crate::tcp::TcpState;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

fn wait_with_deadline<'a, T>(condvar: &std::sync::Condvar, mut guard: MutexGuard<'a, T>, deadline: Option<Instant>) -> Result<MutexGuard<'a, T>, SocketError> {
    match deadline {
        None => Ok(condvar.wait(guard).unwrap()),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(SocketError::TimedOut);
            }
            let (next, _result) = condvar.wait_timeout(guard, d - now).unwrap();
            guard = next;
            Ok(guard)
        }
    }
}

pub struct TcpListener {
    key: SocketKey,
    table: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
}

impl TcpListener {
    pub fn bind(table: &Arc<SocketTable>, transport: &Arc<dyn Transport>, local: (IpAddr, u16), backlog: usize) -> Result<Self, SocketError> {
        let key = table.tcp_listen(local, backlog)?;
        Ok(TcpListener { key, table: table.clone(), transport: transport.clone() })
    }

    pub fn accept(&self, timeout: Option<Duration>) -> Result<TcpSocket, SocketError> {
        TcpSocket::accept(&self.table, &self.transport, self.key, timeout)
    }
}

pub struct TcpSocket {
    key: SocketKey,
    handle: TcbHandle,
    table: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
}

impl TcpSocket {
    pub fn connect(table: &Arc<SocketTable>, transport: &Arc<dyn Transport>, local_ip: IpAddr, remote: (IpAddr, u16), timeout: Option<Duration>) -> Result<Self, SocketError> {
        let (key, handle) = table.tcp_connect(local_ip, remote)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = handle.0.lock().unwrap();
        loop {
            match guard.state {
                TcpState::Established => break,
                TcpState::Closed => {
                    drop(guard);
                    table.tcp_remove(&key);
                    return Err(SocketError::ConnectionRefused);
                }
                _ => {}
            }
            guard = match wait_with_deadline(&handle.1, guard, deadline) {
                Ok(g) => g,
                Err(e) => {
                    table.tcp_remove(&key);
                    return Err(e);
                }
            };
        }
        drop(guard);
        Ok(TcpSocket { key, handle, table: table.clone(), transport: transport.clone() })
    }

    fn accept(table: &Arc<SocketTable>, transport: &Arc<dyn Transport>, listen_key: SocketKey, timeout: Option<Duration>) -> Result<Self, SocketError> {
        let listener = table.tcp_handle(&listen_key).ok_or(SocketError::NotConnected)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = listener.0.lock().unwrap();
        loop {
            if let Some((local_ip, local_port, remote_ip, remote_port)) = guard.accept_queue.pop_front() {
                drop(guard);
                let child_key = SocketKey::connected((local_ip, local_port), (remote_ip, remote_port));
                let handle = table.tcp_handle(&child_key).ok_or(SocketError::NotConnected)?;
                return Ok(TcpSocket { key: child_key, handle, table: table.clone(), transport: transport.clone() });
            }
            guard = wait_with_deadline(&listener.1, guard, deadline)?;
        }
    }

    pub fn local_addr(&self) -> (IpAddr, u16) {
        self.key.local
    }

    pub fn peer_addr(&self) -> (IpAddr, u16) {
        self.key.remote
    }

    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize, SocketError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.handle.0.lock().unwrap();
        loop {
            let n = guard.send(data)?;
            if n > 0 {
                let now = self.transport.now();
                let segments = guard.flush_send(now);
                let (local, remote) = (guard.local, guard.remote);
                drop(guard);
                if !segments.is_empty() {
                    self.transport.send_tcp(local, remote, segments);
                }
                return Ok(n);
            }
            guard = wait_with_deadline(&self.handle.1, guard, deadline)?;
        }
    }

    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, SocketError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.handle.0.lock().unwrap();
        loop {
            match guard.recv(buf) {
                Ok(n) => return Ok(n),
                Err(SocketError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
            guard = wait_with_deadline(&self.handle.1, guard, deadline)?;
        }
    }

    pub fn close(&self) {
        let now = self.transport.now();
        let (local, remote, segments) = {
            let mut guard = self.handle.0.lock().unwrap();
            let segments = guard.close(now);
            (guard.local, guard.remote, segments)
        };
        if !segments.is_empty() {
            self.transport.send_tcp(local, remote, segments);
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let state = self.handle.0.lock().unwrap().state;
        if state == TcpState::Closed {
            self.table.tcp_remove(&self.key);
        }
    }
}
