use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{Images, State};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("client disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub port: u16,
    /// Sleep inserted every `pace_every` cycles to approximate the real clock.
    pub pause: Duration,
    pub pace_every: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            port: 2323,
            pause: Duration::from_micros(9),
            pace_every: 128,
        }
    }
}

const PROGRESS_EVERY: u64 = 10_000_000;

/// Couples the emulated UART to one TCP client.
pub struct Bridge<'a> {
    images: Images<'a>,
    state: State,
    stream: TcpStream,
    pending_tx: Option<u8>,
    cycles: u64,
    config: BridgeConfig,
}

impl<'a> Bridge<'a> {
    pub fn new(images: Images<'a>, state: State, stream: TcpStream, config: BridgeConfig) -> Result<Bridge<'a>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Bridge {
            images,
            state,
            stream,
            pending_tx: None,
            cycles: 0,
            config,
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn send(&mut self) -> Result<()> {
        if self.pending_tx.is_none() {
            self.pending_tx = self.state.take_tx();
        }

        if let Some(byte) = self.pending_tx {
            match self.stream.write(&[byte]) {
                Ok(0) => return Err(BridgeError::Disconnected),
                Ok(_) => {
                    debug!("tx {:02x}", byte);
                    self.pending_tx = None;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                    return Err(BridgeError::Disconnected)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<()> {
        if !self.state.can_receive() {
            return Ok(());
        }

        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(BridgeError::Disconnected),
            Ok(_) => {
                debug!("rx {:02x}", buf[0]);
                self.state.receive(buf[0]);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Err(BridgeError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves at most one byte each way. Only called at instruction boundaries.
    pub fn exchange(&mut self) -> Result<()> {
        self.send()?;
        self.recv()
    }

    /// Runs until the client goes away or the socket fails.
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        loop {
            let done = self.images.step(&mut self.state);
            self.cycles += 1;

            if self.config.pace_every > 0 && self.cycles % self.config.pace_every == 0 {
                thread::sleep(self.config.pause);
            }
            if self.cycles % PROGRESS_EVERY == 0 {
                info!("{} cycles in {:?}", self.cycles, start.elapsed());
            }

            if done {
                if let Some(code) = self.state.trap_code() {
                    warn!("trap {:02x} {:?}", code, self.state);
                }
                self.exchange()?;
            }
        }
    }
}

/// Powers the machine on, then serves the first client that connects.
pub fn serve(images: Images, config: BridgeConfig) -> Result<()> {
    let mut state = State::new();
    let cycles = images.run_until_init(&mut state);
    info!("init done after {} cycles", cycles);

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
    info!("listening on {}", listener.local_addr()?);
    let (stream, peer) = listener.accept()?;
    info!("connection from {}", peer);

    let mut bridge = Bridge::new(images, state, stream, config)?;
    match bridge.run() {
        Err(BridgeError::Disconnected) => {
            info!("client disconnected after {} cycles", bridge.cycles());
            Ok(())
        }
        other => other,
    }
}
