//! Server assembly: worker pool, acceptor, shared state, shutdown.
//!
//! Workers come up first and never migrate work between each other; the
//! acceptor is created last and runs on the caller's thread. Shutdown is a
//! shared flag plus one wake byte per worker.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::net::acceptor::Acceptor;
use crate::net::connection::ConnectionRegistry;
use crate::net::worker::{WakeHandle, Worker, WorkerHandle};

/// The assembled front-end.
pub struct Server {
    acceptor: Acceptor,
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
}

/// Clonable handle that stops the server from another thread.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wakes: Vec<WakeHandle>,
}

impl Shutdown {
    pub fn signal(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        for wake in &self.wakes {
            wake.notify();
        }
    }
}

impl Server {
    /// Bind the listener and start the worker pool.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let num_workers = config.workers.unwrap_or_else(num_cpus).max(1);
        let queue_size = config.queue_size.max(1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConnectionRegistry::new());

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            workers.push(Worker::spawn(
                id,
                queue_size,
                Arc::clone(&registry),
                Arc::clone(&shutdown),
                Arc::clone(&active),
                config.protocol,
            )?);
        }

        let acceptor = Acceptor::bind(
            addr,
            Arc::clone(&shutdown),
            Arc::clone(&active),
            config.max_connections,
        )?;

        info!(
            addr = %acceptor.local_addr(),
            workers = num_workers,
            protocol = ?config.protocol,
            "server ready"
        );

        Ok(Self {
            acceptor,
            workers,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            flag: Arc::clone(&self.shutdown),
            wakes: self.workers.iter().map(|w| w.wake).collect(),
        }
    }

    /// Run the accept loop until shutdown, then drain and join the workers.
    pub fn run(self) -> io::Result<()> {
        let Server {
            acceptor,
            workers,
            shutdown,
        } = self;

        let result = acceptor.run(&workers);

        // Whatever stopped the acceptor stops the workers too.
        if !shutdown.swap(true, Ordering::AcqRel) {
            for worker in &workers {
                worker.wake.notify();
            }
        }
        for worker in workers {
            worker.join();
        }
        result
    }
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
