//! Host name resolution shared by every worker
//!
//! A [`Resolver`] owns a small pool of threads performing blocking lookups.
//! Workers hold cloned [`ResolverHandle`]s: a lookup that can be answered
//! right away (IP literal, static override, cache hit) returns
//! [`Resolution::Ready`], anything else is queued and returns
//! [`Resolution::Pending`]; the callback then runs on a resolver thread once
//! the answer is known. The calling thread never blocks on the network.

pub mod cache;
pub mod doh;

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use burrow_command::config::{ResolverConfig, ResolverMode, MAX_HOST_NAME_LEN};

use crate::resolver::{
    cache::HostCache,
    doh::{DnsStatus, DohLookup},
};

/// how often idle resolver threads check the stop flag
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("invalid host name {0:?}")]
    InvalidHost(String),
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("system resolver failed for {host}: {error}")]
    System { host: String, error: std::io::Error },
    #[error("could not build the DNS-over-HTTPS client: {0}")]
    HttpClient(reqwest::Error),
    #[error("DNS-over-HTTPS request for {host} failed: {error}")]
    Http { host: String, error: reqwest::Error },
    #[error("DNS-over-HTTPS server answered with HTTP status {0}")]
    HttpStatus(u16),
    #[error("invalid DNS-over-HTTPS response: {0}")]
    InvalidResponse(String),
    #[error("could not resolve {host}: {status}")]
    Dns { host: String, status: DnsStatus },
    #[error("could not spawn resolver thread: {0}")]
    Spawn(std::io::Error),
    #[error("the resolver is stopped")]
    Stopped,
}

/// A blocking name lookup, run on resolver threads only
pub trait Lookup: Send + Sync {
    fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// the platform resolver
pub struct SystemLookup;

impl Lookup for SystemLookup {
    fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let mut addresses: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|error| ResolveError::System {
                host: host.to_owned(),
                error,
            })?
            .map(|address| address.ip())
            .collect();
        addresses.dedup();

        if addresses.is_empty() {
            return Err(ResolveError::NoAddress(host.to_owned()));
        }
        Ok(addresses)
    }
}

pub type ResolveCallback = Box<dyn FnOnce(Result<Vec<SocketAddr>, ResolveError>) + Send>;

#[derive(Debug)]
pub enum Resolution {
    Ready(Vec<SocketAddr>),
    /// the callback will be called from a resolver thread
    Pending,
    Failed(ResolveError),
}

struct Job {
    host: String,
    port: u16,
    callback: ResolveCallback,
}

struct Shared {
    lookup: Box<dyn Lookup>,
    cache: Mutex<HostCache>,
    overrides: BTreeMap<String, Vec<IpAddr>>,
    stopped: AtomicBool,
}

impl Shared {
    fn cache(&self) -> MutexGuard<'_, HostCache> {
        // the cache holds no invariant a panicking holder could break
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ResolverHandle {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
}

impl ResolverHandle {
    pub fn lookup(&self, host: &str, port: u16, callback: ResolveCallback) -> Resolution {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Resolution::Ready(vec![SocketAddr::new(ip, port)]);
        }

        if host.is_empty() || host.len() > MAX_HOST_NAME_LEN {
            return Resolution::Failed(ResolveError::InvalidHost(host.to_owned()));
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Resolution::Failed(ResolveError::Stopped);
        }

        let host = host.to_ascii_lowercase();
        if let Some(addresses) = self.shared.overrides.get(&host) {
            return Resolution::Ready(with_port(addresses, port));
        }
        if let Some(addresses) = self.shared.cache().get(&host, Instant::now()) {
            incr!("resolver.cache.hit");
            return Resolution::Ready(with_port(&addresses, port));
        }

        incr!("resolver.cache.miss");
        match self.jobs.send(Job {
            host,
            port,
            callback,
        }) {
            Ok(()) => Resolution::Pending,
            Err(_) => Resolution::Failed(ResolveError::Stopped),
        }
    }

    /// drops a cached answer, the next lookup goes to the network
    pub fn forget(&self, host: &str) {
        if self.shared.cache().remove(&host.to_ascii_lowercase()) {
            debug!("RESOLVER\tforgot cached addresses of {}", host);
        }
    }
}

pub struct Resolver {
    handle: ResolverHandle,
    threads: Vec<JoinHandle<()>>,
}

impl Resolver {
    /// the lookup implementation is chosen by the configured mode
    pub fn from_config(config: &ResolverConfig) -> Result<Resolver, ResolveError> {
        let lookup: Box<dyn Lookup> = match config.mode {
            ResolverMode::System => Box::new(SystemLookup),
            ResolverMode::Doh => Box::new(DohLookup::new(&config.doh_url, config.timeout)?),
        };
        Resolver::start(lookup, config)
    }

    pub fn start(lookup: Box<dyn Lookup>, config: &ResolverConfig) -> Result<Resolver, ResolveError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let overrides = config
            .hosts
            .iter()
            .map(|(host, addresses)| (host.to_ascii_lowercase(), addresses.clone()))
            .collect();

        let shared = Arc::new(Shared {
            lookup,
            cache: Mutex::new(HostCache::new(config.cache_capacity, config.cache_ttl)),
            overrides,
            stopped: AtomicBool::new(false),
        });

        let mut resolver = Resolver {
            handle: ResolverHandle {
                shared: shared.clone(),
                jobs: sender,
            },
            threads: Vec::with_capacity(config.threads),
        };

        for index in 0..config.threads.max(1) {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("resolver-{index}"))
                .spawn(move || resolver_loop(shared, receiver));

            match spawned {
                Ok(thread) => resolver.threads.push(thread),
                Err(error) => {
                    resolver.shutdown();
                    return Err(ResolveError::Spawn(error));
                }
            }
        }

        info!(
            "RESOLVER\tstarted {} threads, {} static hosts",
            resolver.threads.len(),
            config.hosts.len()
        );
        Ok(resolver)
    }

    pub fn handle(&self) -> ResolverHandle {
        self.handle.clone()
    }

    /// Stops and joins the resolver threads. Queued lookups are dropped
    /// and handles still alive fail every new lookup.
    pub fn shutdown(self) {
        self.handle.shared.stopped.store(true, Ordering::Release);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("RESOLVER\ta resolver thread panicked");
            }
        }
        debug!("RESOLVER\tstopped");
    }
}

fn resolver_loop(shared: Arc<Shared>, receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            return;
        }

        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv_timeout(IDLE_POLL)
        };

        let Job {
            host,
            port,
            callback,
        } = match job {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if shared.stopped.load(Ordering::Acquire) {
            return;
        }

        // several clients may have queued the same host
        if let Some(addresses) = shared.cache().get(&host, Instant::now()) {
            callback(Ok(with_port(&addresses, port)));
            continue;
        }

        let start = Instant::now();
        let result = shared.lookup.lookup(&host);
        time!("resolver.lookup_time", start.elapsed().as_millis());

        match result {
            Ok(addresses) => {
                debug!("RESOLVER\t{} resolved to {:?}", host, addresses);
                shared.cache().insert(&host, addresses.clone(), Instant::now());
                callback(Ok(with_port(&addresses, port)));
            }
            Err(error) => {
                incr!("resolver.failure");
                warn!("RESOLVER\tcould not resolve {}: {}", host, error);
                callback(Err(error));
            }
        }
    }
}

fn with_port(addresses: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    addresses
        .iter()
        .map(|ip| SocketAddr::new(*ip, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// answers from a table and counts calls
    struct TableLookup {
        table: BTreeMap<String, Vec<IpAddr>>,
        calls: Arc<AtomicUsize>,
    }

    impl Lookup for TableLookup {
        fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.table
                .get(host)
                .cloned()
                .ok_or_else(|| ResolveError::NoAddress(host.to_owned()))
        }
    }

    fn start_resolver(hosts: BTreeMap<String, Vec<IpAddr>>) -> (Resolver, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = BTreeMap::new();
        table.insert(
            "example.com".to_owned(),
            vec!["93.184.216.34".parse().unwrap()],
        );

        let config = ResolverConfig {
            hosts,
            ..Default::default()
        };
        let resolver = Resolver::start(
            Box::new(TableLookup {
                table,
                calls: calls.clone(),
            }),
            &config,
        )
        .expect("could not start resolver");
        (resolver, calls)
    }

    fn wait_for(
        handle: &ResolverHandle,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        let (sender, receiver) = mpsc::channel();
        match handle.lookup(
            host,
            port,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        ) {
            Resolution::Ready(addresses) => Ok(addresses),
            Resolution::Failed(error) => Err(error),
            Resolution::Pending => receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("resolver never answered"),
        }
    }

    fn noop() -> ResolveCallback {
        Box::new(|_| {})
    }

    #[test]
    fn ip_literals_are_ready() {
        let (resolver, calls) = start_resolver(BTreeMap::new());
        let handle = resolver.handle();

        match handle.lookup("127.0.0.1", 80, noop()) {
            Resolution::Ready(addresses) => {
                assert_eq!(addresses, vec!["127.0.0.1:80".parse().unwrap()])
            }
            other => panic!("unexpected resolution {other:?}"),
        }
        match handle.lookup("[::1]", 443, noop()) {
            Resolution::Ready(addresses) => {
                assert_eq!(addresses, vec!["[::1]:443".parse().unwrap()])
            }
            other => panic!("unexpected resolution {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        resolver.shutdown();
    }

    #[test]
    fn overrides_are_ready() {
        let mut hosts = BTreeMap::new();
        hosts.insert("Intranet.Local".to_owned(), vec!["10.0.0.12".parse().unwrap()]);
        let (resolver, calls) = start_resolver(hosts);

        match resolver.handle().lookup("intranet.local", 8080, noop()) {
            Resolution::Ready(addresses) => {
                assert_eq!(addresses, vec!["10.0.0.12:8080".parse().unwrap()])
            }
            other => panic!("unexpected resolution {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        resolver.shutdown();
    }

    #[test]
    fn pending_lookup_then_cache_hit() {
        let (resolver, calls) = start_resolver(BTreeMap::new());
        let handle = resolver.handle();

        assert!(matches!(
            handle.lookup("example.com", 443, noop()),
            Resolution::Pending
        ));
        let addresses = wait_for(&handle, "example.com", 443).unwrap();
        assert_eq!(addresses, vec!["93.184.216.34:443".parse().unwrap()]);

        // answered from the cache now
        match handle.lookup("EXAMPLE.com", 80, noop()) {
            Resolution::Ready(addresses) => {
                assert_eq!(addresses, vec!["93.184.216.34:80".parse().unwrap()])
            }
            other => panic!("unexpected resolution {other:?}"),
        }
        assert!(calls.load(Ordering::SeqCst) >= 1);

        handle.forget("example.com");
        assert!(matches!(
            handle.lookup("example.com", 443, noop()),
            Resolution::Pending
        ));
        resolver.shutdown();
    }

    #[test]
    fn failures_reach_the_callback() {
        let (resolver, _) = start_resolver(BTreeMap::new());
        let handle = resolver.handle();

        assert!(matches!(
            wait_for(&handle, "unknown.test", 443),
            Err(ResolveError::NoAddress(_))
        ));
        assert!(matches!(
            handle.lookup("", 443, noop()),
            Resolution::Failed(ResolveError::InvalidHost(_))
        ));
        resolver.shutdown();
    }

    #[test]
    fn lookups_fail_after_shutdown() {
        let (resolver, _) = start_resolver(BTreeMap::new());
        let handle = resolver.handle();
        resolver.shutdown();

        assert!(matches!(
            handle.lookup("example.com", 443, noop()),
            Resolution::Failed(ResolveError::Stopped)
        ));
    }
}
