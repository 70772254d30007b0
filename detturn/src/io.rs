/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wrappers for syscalls that may block on external events.
//!
//! These cannot run under the turn: a thread holding the turn while parked
//! inside `accept` would stall the entire timeline.  Instead the caller
//! leaves the run queue (`block`), performs the real syscall, rejoins
//! (`wakeup`), and then serializes its *completion* with one ordinary turn
//! that logs the event.  The thread is outside deterministic scheduling
//! exactly for the duration of the syscall, which is the point: external
//! events are not ours to order.
//!
//! Regular-file read/write/close bypass the protocol entirely (controlled
//! by `ignore_rw_regular_file`): they exhibit no inter-process
//! non-determinism worth serializing.

use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use detturn_model::Ins;
use detturn_model::SyncOp;
use libc::c_int;
use libc::off_t;
use nix::poll::PollFd;
use nix::sys::epoll::EpollEvent;
use nix::sys::select::FdSet;
use nix::sys::socket;
use nix::sys::socket::MsgFlags;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockaddrLike;
use nix::sys::socket::SockaddrStorage;
use nix::sys::stat::fstat;
use nix::sys::time::TimeVal;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd;
use nix::unistd::Pid;

use crate::thread_state;
use crate::thread_state::ThreadCtx;
use crate::Runtime;

/// Neither a socket nor a fifo: not an inter-process communication medium.
fn regular_file(fd: RawFd) -> bool {
    match fstat(fd) {
        Ok(st) => {
            let fmt = st.st_mode & libc::S_IFMT;
            fmt != libc::S_IFSOCK && fmt != libc::S_IFIFO
        }
        Err(_) => true,
    }
}

/// The local port of a socket, for connection identity in the log.
fn local_port(fd: RawFd) -> u64 {
    match socket::getsockname::<SockaddrStorage>(fd) {
        Ok(ss) => ss
            .as_sockaddr_in()
            .map(|s| s.port() as u64)
            .or_else(|| ss.as_sockaddr_in6().map(|s| s.port() as u64))
            .unwrap_or(0),
        Err(_) => 0,
    }
}

/// The peer port of a connected socket.
fn peer_port(fd: RawFd) -> u64 {
    match socket::getpeername::<SockaddrStorage>(fd) {
        Ok(ss) => ss
            .as_sockaddr_in()
            .map(|s| s.port() as u64)
            .or_else(|| ss.as_sockaddr_in6().map(|s| s.port() as u64))
            .unwrap_or(0),
        Err(_) => 0,
    }
}

fn code_usize(r: &nix::Result<usize>) -> u64 {
    match r {
        Ok(n) => *n as u64,
        Err(e) => *e as u64,
    }
}

fn code_int(r: &nix::Result<c_int>) -> u64 {
    match r {
        Ok(n) => *n as u64,
        Err(e) => *e as u64,
    }
}

impl Runtime {
    /// Leave the deterministic queue ahead of an externally blocking call.
    /// Returns `None` when the call should pass straight through (non-det
    /// region or scheduling disabled).
    fn block_enter(&self) -> Option<Rc<ThreadCtx>> {
        self.stats.add_inter_proc();
        if self.passthrough() || self.in_nondet() {
            return None;
        }
        let ctx = thread_state::current();
        self.sched.block(&ctx.desc);
        Some(ctx)
    }

    /// Rejoin the queue and serialize the completion with one logged turn.
    fn block_exit(&self, ctx: Option<Rc<ThreadCtx>>, ins: Ins, op: SyncOp, args: &[u64]) {
        let ctx = match ctx {
            None => return,
            Some(ctx) => ctx,
        };
        self.sched.wakeup(&ctx.desc);
        if self.config().log_sync {
            ctx.app_time.set(ctx.update_time());
        }
        self.sched.get_turn(&ctx.desc);
        if self.config().log_sync {
            ctx.sched_time.set(ctx.update_time());
        }
        let turn = self.sched.inc_turn(&ctx.desc);
        if self.config().log_sync {
            ctx.syscall_time.set(ctx.update_time());
            self.log_event(&ctx, ins, op, turn, true, false, args);
        }
        self.sched.put_turn(&ctx.desc, false);
    }

    /// Accept a connection.  Both endpoints' ports are logged so the log
    /// captures the connection identity.
    pub fn accept(&self, ins: Ins, fd: RawFd) -> nix::Result<RawFd> {
        let ctx = self.block_enter();
        let ret = socket::accept(fd);
        let args = match &ret {
            Ok(newfd) => [*newfd as u64, local_port(fd), peer_port(*newfd)],
            Err(e) => [*e as u64, local_port(fd), 0],
        };
        self.block_exit(ctx, ins, SyncOp::Accept, &args);
        ret
    }

    /// Accept with flags.
    pub fn accept4(&self, ins: Ins, fd: RawFd, flags: SockFlag) -> nix::Result<RawFd> {
        let ctx = self.block_enter();
        let ret = socket::accept4(fd, flags);
        let code = match &ret {
            Ok(newfd) => *newfd as u64,
            Err(e) => *e as u64,
        };
        self.block_exit(ctx, ins, SyncOp::Accept4, &[code]);
        ret
    }

    /// Connect a socket.
    pub fn connect<A: SockaddrLike>(&self, ins: Ins, fd: RawFd, addr: &A) -> nix::Result<()> {
        let ctx = self.block_enter();
        let ret = socket::connect(fd, addr);
        let code = match &ret {
            Ok(()) => 0,
            Err(e) => *e as u64,
        };
        self.block_exit(
            ctx,
            ins,
            SyncOp::Connect,
            &[fd as u64, local_port(fd), peer_port(fd), code],
        );
        ret
    }

    /// Send on a socket.  Even when the socket is non-blocking this runs
    /// under the block protocol: the other endpoint is another process.
    pub fn send(&self, ins: Ins, fd: RawFd, buf: &[u8], flags: MsgFlags) -> nix::Result<usize> {
        let ctx = self.block_enter();
        let ret = socket::send(fd, buf, flags);
        self.block_exit(ctx, ins, SyncOp::Send, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Send to an explicit address.
    pub fn sendto<A: SockaddrLike>(
        &self,
        ins: Ins,
        fd: RawFd,
        buf: &[u8],
        addr: &A,
        flags: MsgFlags,
    ) -> nix::Result<usize> {
        let ctx = self.block_enter();
        let ret = socket::sendto(fd, buf, addr, flags);
        self.block_exit(ctx, ins, SyncOp::Sendto, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Receive from a socket.
    pub fn recv(&self, ins: Ins, fd: RawFd, buf: &mut [u8], flags: MsgFlags) -> nix::Result<usize> {
        let ctx = self.block_enter();
        let ret = socket::recv(fd, buf, flags);
        self.block_exit(ctx, ins, SyncOp::Recv, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Receive along with the sender's address.
    pub fn recvfrom<A: SockaddrLike>(
        &self,
        ins: Ins,
        fd: RawFd,
        buf: &mut [u8],
    ) -> nix::Result<(usize, Option<A>)> {
        let ctx = self.block_enter();
        let ret = socket::recvfrom::<A>(fd, buf);
        let code = match &ret {
            Ok((n, _)) => *n as u64,
            Err(e) => *e as u64,
        };
        self.block_exit(ctx, ins, SyncOp::Recvfrom, &[fd as u64, code]);
        ret
    }

    /// Read from an fd.  Regular files bypass the protocol.
    pub fn read(&self, ins: Ins, fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
        if self.config().ignore_rw_regular_file && regular_file(fd) {
            return unistd::read(fd, buf);
        }
        let ctx = self.block_enter();
        let ret = unistd::read(fd, buf);
        self.block_exit(ctx, ins, SyncOp::Read, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Write to an fd.  Regular files bypass the protocol.
    pub fn write(&self, ins: Ins, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
        if self.config().ignore_rw_regular_file && regular_file(fd) {
            return unistd::write(fd, buf);
        }
        let ctx = self.block_enter();
        let ret = unistd::write(fd, buf);
        self.block_exit(ctx, ins, SyncOp::Write, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Positioned read.  Regular files bypass the protocol.
    pub fn pread(&self, ins: Ins, fd: RawFd, buf: &mut [u8], offset: off_t) -> nix::Result<usize> {
        if self.config().ignore_rw_regular_file && regular_file(fd) {
            return nix::sys::uio::pread(fd, buf, offset);
        }
        let ctx = self.block_enter();
        let ret = nix::sys::uio::pread(fd, buf, offset);
        self.block_exit(ctx, ins, SyncOp::Pread, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Positioned write.  Regular files bypass the protocol.
    pub fn pwrite(&self, ins: Ins, fd: RawFd, buf: &[u8], offset: off_t) -> nix::Result<usize> {
        if self.config().ignore_rw_regular_file && regular_file(fd) {
            return nix::sys::uio::pwrite(fd, buf, offset);
        }
        let ctx = self.block_enter();
        let ret = nix::sys::uio::pwrite(fd, buf, offset);
        self.block_exit(ctx, ins, SyncOp::Pwrite, &[fd as u64, code_usize(&ret)]);
        ret
    }

    /// Close an fd.  Regular files bypass; otherwise the close is an
    /// inter-process event (the peer observes it) and is serialized.  For
    /// servers this is also where the stat summary is printed, accepting
    /// some non-determinism in the printout itself.
    pub fn close(&self, ins: Ins, fd: RawFd) -> nix::Result<()> {
        if self.config().ignore_rw_regular_file && regular_file(fd) {
            return unistd::close(fd);
        }
        let ctx = self.block_enter();
        let ret = unistd::close(fd);
        let code = match &ret {
            Ok(()) => 0,
            Err(e) => *e as u64,
        };
        self.block_exit(ctx, ins, SyncOp::Close, &[fd as u64, code]);
        if self.config().record_runtime_stat {
            tracing::info!("runtime stats:\n{}", self.stats.snapshot());
        }
        ret
    }

    /// Wait for readiness with `select`.
    pub fn select(
        &self,
        ins: Ins,
        nfds: Option<c_int>,
        readfds: Option<&mut FdSet>,
        writefds: Option<&mut FdSet>,
        errorfds: Option<&mut FdSet>,
        timeout: Option<&mut TimeVal>,
    ) -> nix::Result<c_int> {
        let ctx = self.block_enter();
        let ret = nix::sys::select::select(nfds, readfds, writefds, errorfds, timeout);
        self.block_exit(ctx, ins, SyncOp::Select, &[code_int(&ret)]);
        ret
    }

    /// Wait for readiness with `poll`.
    pub fn poll(&self, ins: Ins, fds: &mut [PollFd], timeout_ms: c_int) -> nix::Result<c_int> {
        let ctx = self.block_enter();
        let ret = nix::poll::poll(fds, timeout_ms);
        self.block_exit(
            ctx,
            ins,
            SyncOp::Poll,
            &[fds.len() as u64, timeout_ms as u64, code_int(&ret)],
        );
        ret
    }

    /// Wait for readiness with `epoll_wait`.
    pub fn epoll_wait(
        &self,
        ins: Ins,
        epfd: RawFd,
        events: &mut [EpollEvent],
        timeout_ms: isize,
    ) -> nix::Result<usize> {
        let ctx = self.block_enter();
        let ret = nix::sys::epoll::epoll_wait(epfd, events, timeout_ms);
        self.block_exit(ctx, ins, SyncOp::EpollWait, &[code_usize(&ret)]);
        ret
    }

    /// Reap a child process.
    pub fn waitpid(
        &self,
        ins: Ins,
        pid: Option<Pid>,
        options: Option<WaitPidFlag>,
    ) -> nix::Result<WaitStatus> {
        let ctx = self.block_enter();
        let ret = nix::sys::wait::waitpid(pid, options);
        let arg = pid.map(|p| p.as_raw() as u64).unwrap_or(0);
        let code = match &ret {
            Ok(_) => 0,
            Err(e) => *e as u64,
        };
        self.block_exit(ctx, ins, SyncOp::Waitpid, &[arg, code]);
        ret
    }

    /// Resolve a `host:port` string.  Name resolution talks to external
    /// services, so it runs under the block protocol.
    pub fn lookup_host(&self, ins: Ins, host: &str) -> std::io::Result<Vec<SocketAddr>> {
        let ctx = self.block_enter();
        let ret = host.to_socket_addrs().map(|it| it.collect::<Vec<_>>());
        let code = match &ret {
            Ok(v) => v.len() as u64,
            Err(_) => u64::MAX,
        };
        self.block_exit(ctx, ins, SyncOp::LookupHost, &[code]);
        ret
    }

    /// Sleep for a duration of logical time: the deadline is a turn count,
    /// and the wait parks on no channel at all.  A native sleep follows only
    /// when `exec_sleep` is set; by default time is purely logical.
    pub fn sleep(&self, ins: Ins, dur: Duration) {
        if self.passthrough() || self.in_nondet() {
            std::thread::sleep(dur);
            return;
        }
        let ctx = self.sched_start();
        let turns = crate::clock::rel_to_turns(self.config(), self.registry.nthread(), dur);
        let deadline = self.sched.turn_count().deadline_after(turns);
        let _ = self.sched.wait(&ctx.desc, None, deadline);
        self.sched_end(
            &ctx,
            ins,
            SyncOp::Sleep,
            false,
            &[dur.as_nanos() as u64],
        );
        if self.config().exec_sleep {
            std::thread::sleep(dur);
        }
    }
}
