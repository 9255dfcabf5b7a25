//! Shared listeners for association acceptors.
//!
//! Several application entity titles may serve on the same local
//! endpoint. The [`ListenerRegistry`] keeps one TCP listener and one
//! background accept loop per endpoint, and routes each incoming
//! association to the registered title named by the request's called
//! AE title; a request calling an unregistered title is rejected.
//!
//! Registration is reference counted per endpoint:
//! the first title registered on an endpoint binds the socket and
//! starts the accept loop, and removing the last title tears both down.
use snafu::{Backtrace, ResultExt, Snafu};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::association::queue::CancelToken;
use crate::association::{AcceptorResolver, Association, AssociationHandler, EngineOptions};
use crate::negotiation::AcceptorOptions;
use crate::transport::{SocketOptions, TcpTransport};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not bind listener on {}: {}", endpoint, source))]
    Bind {
        endpoint: SocketAddr,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("AE title `{}` is already registered on {}", ae_title, endpoint))]
    AlreadyRegistered {
        ae_title: String,
        endpoint: SocketAddr,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a fresh handler for each association on a registered title.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn AssociationHandler> + Send + Sync>;

struct Registration {
    options: Arc<AcceptorOptions<'static>>,
    factory: HandlerFactory,
}

struct Endpoint {
    /// registered titles, shared with the accept loop's resolver
    titles: Arc<Mutex<HashMap<String, Registration>>>,
    cancel: CancelToken,
    accept_thread: Option<JoinHandle<()>>,
}

/// A registry of shared association listeners,
/// the only structure shared across associations.
///
/// Construct one and pass it around (typically in an [`Arc`]);
/// it is not ambient global state.
#[derive(Default)]
pub struct ListenerRegistry {
    endpoints: Mutex<HashMap<SocketAddr, Endpoint>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an AE title to serve associations on the given endpoint.
    ///
    /// The first registration on an endpoint binds the socket and
    /// starts its accept loop; its `engine_options` and
    /// `socket_options` then govern every connection on that endpoint.
    /// Returns the actual bound address,
    /// which callers should use for subsequent registrations
    /// when binding to an ephemeral port.
    pub fn register(
        &self,
        endpoint: SocketAddr,
        options: AcceptorOptions<'static>,
        engine_options: EngineOptions,
        socket_options: SocketOptions,
        factory: HandlerFactory,
    ) -> Result<SocketAddr> {
        let ae_title = options.ae_title.to_string();
        let mut endpoints = lock(&self.endpoints);

        if let Some(entry) = endpoints.get_mut(&endpoint) {
            let mut titles = lock(&entry.titles);
            if titles.contains_key(&ae_title) {
                return AlreadyRegisteredSnafu { ae_title, endpoint }.fail();
            }
            titles.insert(
                ae_title,
                Registration {
                    options: Arc::new(options),
                    factory,
                },
            );
            return Ok(endpoint);
        }

        let listener = TcpListener::bind(endpoint).context(BindSnafu { endpoint })?;
        let bound = listener.local_addr().context(BindSnafu { endpoint })?;
        listener
            .set_nonblocking(true)
            .context(BindSnafu { endpoint })?;

        let titles = Arc::new(Mutex::new(HashMap::new()));
        lock(&titles).insert(
            ae_title,
            Registration {
                options: Arc::new(options),
                factory,
            },
        );

        let cancel = CancelToken::new();
        let loop_titles = Arc::clone(&titles);
        let loop_cancel = cancel.clone();
        let accept_thread = std::thread::spawn(move || {
            accept_loop(
                listener,
                loop_titles,
                loop_cancel,
                engine_options,
                socket_options,
            );
        });

        endpoints.insert(
            bound,
            Endpoint {
                titles,
                cancel,
                accept_thread: Some(accept_thread),
            },
        );
        debug!(endpoint = %bound, "listener started");
        Ok(bound)
    }

    /// Remove an AE title from an endpoint.
    ///
    /// When the last title leaves,
    /// the accept loop stops and the socket is released.
    /// Returns whether the title was registered.
    pub fn unregister(&self, endpoint: SocketAddr, ae_title: &str) -> bool {
        let mut endpoints = lock(&self.endpoints);
        let entry = match endpoints.get_mut(&endpoint) {
            Some(entry) => entry,
            None => return false,
        };
        let removed = lock(&entry.titles).remove(ae_title).is_some();
        let empty = lock(&entry.titles).is_empty();
        if empty {
            if let Some(mut entry) = endpoints.remove(&endpoint) {
                entry.cancel.cancel();
                if let Some(handle) = entry.accept_thread.take() {
                    if handle.join().is_err() {
                        warn!(endpoint = %endpoint, "accept loop panicked");
                    }
                }
            }
            debug!(endpoint = %endpoint, "listener stopped");
        }
        removed
    }

    /// The number of endpoints currently listening.
    pub fn endpoint_count(&self) -> usize {
        lock(&self.endpoints).len()
    }

    /// Stop every accept loop and release every socket.
    pub fn close_all(&self) {
        let mut endpoints = lock(&self.endpoints);
        for (endpoint, mut entry) in endpoints.drain() {
            entry.cancel.cancel();
            if let Some(handle) = entry.accept_thread.take() {
                if handle.join().is_err() {
                    warn!(endpoint = %endpoint, "accept loop panicked");
                }
            }
        }
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

fn accept_loop(
    listener: TcpListener,
    titles: Arc<Mutex<HashMap<String, Registration>>>,
    cancel: CancelToken,
    engine_options: EngineOptions,
    socket_options: SocketOptions,
) {
    while !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "connection accepted");
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %peer, "could not configure socket: {}", e);
                    continue;
                }
                let transport = match TcpTransport::from_stream(stream, &socket_options) {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(peer = %peer, "could not configure socket: {}", e);
                        continue;
                    }
                };
                let resolver = title_resolver(Arc::clone(&titles));
                if let Err(e) = Association::accept_multiplexed(
                    Box::new(transport),
                    resolver,
                    engine_options.clone(),
                ) {
                    warn!(peer = %peer, "could not start association: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("listener accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Build the called-AE-title resolver for one connection.
fn title_resolver(titles: Arc<Mutex<HashMap<String, Registration>>>) -> AcceptorResolver {
    Box::new(move |called_ae_title| {
        let titles = lock(&titles);
        titles.get(called_ae_title.trim()).map(|registration| {
            (
                Arc::clone(&registration.options),
                (registration.factory)(),
            )
        })
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    struct NoopHandler;
    impl AssociationHandler for NoopHandler {}

    fn factory() -> HandlerFactory {
        Arc::new(|| Box::new(NoopHandler))
    }

    fn can_connect(addr: SocketAddr) -> bool {
        TcpStream::connect_timeout(&addr, Duration::from_millis(300)).is_ok()
    }

    #[test]
    fn endpoint_is_shared_and_reference_counted() {
        let registry = ListenerRegistry::new();
        let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let bound = registry
            .register(
                endpoint,
                AcceptorOptions::new().ae_title("FIRST"),
                EngineOptions::default(),
                SocketOptions::default(),
                factory(),
            )
            .unwrap();
        registry
            .register(
                bound,
                AcceptorOptions::new().ae_title("SECOND"),
                EngineOptions::default(),
                SocketOptions::default(),
                factory(),
            )
            .unwrap();
        assert_eq!(registry.endpoint_count(), 1);
        assert!(can_connect(bound));

        // one title left, still listening
        assert!(registry.unregister(bound, "FIRST"));
        assert!(can_connect(bound));

        // last title gone, socket released
        assert!(registry.unregister(bound, "SECOND"));
        assert_eq!(registry.endpoint_count(), 0);
        assert!(!can_connect(bound));
    }

    #[test]
    fn duplicate_title_on_one_endpoint_is_refused() {
        let registry = ListenerRegistry::new();
        let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let bound = registry
            .register(
                endpoint,
                AcceptorOptions::new().ae_title("STORAGE"),
                EngineOptions::default(),
                SocketOptions::default(),
                factory(),
            )
            .unwrap();
        let outcome = registry.register(
            bound,
            AcceptorOptions::new().ae_title("STORAGE"),
            EngineOptions::default(),
            SocketOptions::default(),
            factory(),
        );
        assert!(matches!(outcome, Err(Error::AlreadyRegistered { .. })));
        registry.close_all();
    }

    #[test]
    fn unregistering_an_unknown_title_reports_false() {
        let registry = ListenerRegistry::new();
        let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let bound = registry
            .register(
                endpoint,
                AcceptorOptions::new().ae_title("STORAGE"),
                EngineOptions::default(),
                SocketOptions::default(),
                factory(),
            )
            .unwrap();
        assert!(!registry.unregister(bound, "OTHER"));
        assert!(registry.unregister(bound, "STORAGE"));
    }
}
