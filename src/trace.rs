//! Lifecycle hooks for a logical send.
//!
//! A [`TraceHooks`] value is a fixed set of optional callbacks. Clients hold
//! factories rather than hooks so each send gets a fresh record, which lets a
//! hook keep per-call state (timers, buffers) in its captures.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tracing::debug;

pub type Hook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Produces the hooks for one send. Called once per [`crate::Sender::send`].
pub type TraceFactory = Arc<dyn Fn() -> TraceHooks + Send + Sync>;

#[derive(Clone, Debug)]
pub struct CallStart {
    pub method: Method,
    pub uri: String,
}

#[derive(Clone, Debug)]
pub struct CallDone {
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct AttemptStart {
    pub method: Method,
    pub uri: String,
    pub retry_attempt: usize,
    pub redirect: usize,
}

#[derive(Clone, Debug)]
pub struct AttemptDone {
    pub method: Method,
    pub uri: String,
    pub retry_attempt: usize,
    pub redirect: usize,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct RetryWait {
    pub method: Method,
    pub uri: String,
    /// The retry about to be made, 1-based.
    pub retry_attempt: usize,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub struct DecodeStart {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body_len: usize,
}

#[derive(Clone, Debug)]
pub struct DecodeDone {
    pub status: StatusCode,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DnsStart {
    pub host: String,
}

#[derive(Clone, Debug)]
pub struct DnsDone {
    pub host: String,
    pub addrs: usize,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConnectStart {
    pub uri: String,
}

#[derive(Clone, Debug)]
pub struct ConnectDone {
    pub uri: String,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TlsStart {
    pub host: String,
}

#[derive(Clone, Debug)]
pub struct TlsDone {
    pub host: String,
    pub error: Option<String>,
}

/// Connection-level slots, fired by the transport while it dials.
#[derive(Clone, Default)]
pub struct ConnectionTrace {
    pub dns_start: Option<Hook<DnsStart>>,
    pub dns_done: Option<Hook<DnsDone>>,
    pub connect_start: Option<Hook<ConnectStart>>,
    pub connect_done: Option<Hook<ConnectDone>>,
    pub tls_start: Option<Hook<TlsStart>>,
    pub tls_done: Option<Hook<TlsDone>>,
}

#[derive(Clone, Default)]
pub struct TraceHooks {
    pub call_start: Option<Hook<CallStart>>,
    pub call_done: Option<Hook<CallDone>>,
    pub attempt_start: Option<Hook<AttemptStart>>,
    pub attempt_done: Option<Hook<AttemptDone>>,
    pub retry_wait: Option<Hook<RetryWait>>,
    pub decode_start: Option<Hook<DecodeStart>>,
    pub decode_done: Option<Hook<DecodeDone>>,
    pub connection: ConnectionTrace,
}

fn chain<E: 'static>(newer: Option<Hook<E>>, older: Option<Hook<E>>) -> Option<Hook<E>> {
    match (newer, older) {
        (Some(newer), Some(older)) => Some(Arc::new(move |event: &E| {
            newer(event);
            older(event);
        })),
        (newer, older) => newer.or(older),
    }
}

pub(crate) fn fire<E>(slot: &Option<Hook<E>>, event: impl FnOnce() -> E) {
    if let Some(hook) = slot {
        hook(&event());
    }
}

macro_rules! hook_setters {
    ($($method:ident => $slot:ident: $event:ty),+ $(,)?) => {
        $(
            pub fn $method<F>(mut self, hook: F) -> Self
            where
                F: Fn(&$event) + Send + Sync + 'static,
            {
                self.$slot = Some(Arc::new(hook));
                self
            }
        )+
    };
}

impl ConnectionTrace {
    hook_setters! {
        on_dns_start => dns_start: DnsStart,
        on_dns_done => dns_done: DnsDone,
        on_connect_start => connect_start: ConnectStart,
        on_connect_done => connect_done: ConnectDone,
        on_tls_start => tls_start: TlsStart,
        on_tls_done => tls_done: TlsDone,
    }

    pub fn is_empty(&self) -> bool {
        self.dns_start.is_none()
            && self.dns_done.is_none()
            && self.connect_start.is_none()
            && self.connect_done.is_none()
            && self.tls_start.is_none()
            && self.tls_done.is_none()
    }

    /// Merges two records; where both set a slot, `self` runs before `older`.
    pub fn compose(self, older: ConnectionTrace) -> ConnectionTrace {
        ConnectionTrace {
            dns_start: chain(self.dns_start, older.dns_start),
            dns_done: chain(self.dns_done, older.dns_done),
            connect_start: chain(self.connect_start, older.connect_start),
            connect_done: chain(self.connect_done, older.connect_done),
            tls_start: chain(self.tls_start, older.tls_start),
            tls_done: chain(self.tls_done, older.tls_done),
        }
    }
}

impl TraceHooks {
    hook_setters! {
        on_call_start => call_start: CallStart,
        on_call_done => call_done: CallDone,
        on_attempt_start => attempt_start: AttemptStart,
        on_attempt_done => attempt_done: AttemptDone,
        on_retry_wait => retry_wait: RetryWait,
        on_decode_start => decode_start: DecodeStart,
        on_decode_done => decode_done: DecodeDone,
    }

    pub fn with_connection(mut self, connection: ConnectionTrace) -> Self {
        self.connection = connection;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.call_start.is_none()
            && self.call_done.is_none()
            && self.attempt_start.is_none()
            && self.attempt_done.is_none()
            && self.retry_wait.is_none()
            && self.decode_start.is_none()
            && self.decode_done.is_none()
            && self.connection.is_empty()
    }

    /// Merges two records; where both set a slot, `self` runs before `older`.
    pub fn compose(self, older: TraceHooks) -> TraceHooks {
        TraceHooks {
            call_start: chain(self.call_start, older.call_start),
            call_done: chain(self.call_done, older.call_done),
            attempt_start: chain(self.attempt_start, older.attempt_start),
            attempt_done: chain(self.attempt_done, older.attempt_done),
            retry_wait: chain(self.retry_wait, older.retry_wait),
            decode_start: chain(self.decode_start, older.decode_start),
            decode_done: chain(self.decode_done, older.decode_done),
            connection: self.connection.compose(older.connection),
        }
    }

    /// Hooks that report every event through `tracing` at debug level.
    pub fn logging() -> TraceHooks {
        let connection = ConnectionTrace::default()
            .on_dns_start(|event| debug!(host = %event.host, "dns lookup started"))
            .on_dns_done(|event| {
                debug!(host = %event.host, addrs = event.addrs, error = ?event.error, "dns lookup finished")
            })
            .on_connect_start(|event| debug!(uri = %event.uri, "connect started"))
            .on_connect_done(|event| {
                debug!(uri = %event.uri, error = ?event.error, "connect finished")
            })
            .on_tls_start(|event| debug!(host = %event.host, "tls handshake started"))
            .on_tls_done(|event| {
                debug!(host = %event.host, error = ?event.error, "tls handshake finished")
            });

        TraceHooks::default()
            .on_call_start(|event| debug!(method = %event.method, uri = %event.uri, "call started"))
            .on_call_done(|event| {
                debug!(
                    method = %event.method,
                    uri = %event.uri,
                    status = ?event.status.map(|status| status.as_u16()),
                    error = ?event.error,
                    elapsed_ms = event.elapsed.as_millis() as u64,
                    "call finished"
                )
            })
            .on_attempt_start(|event| {
                debug!(
                    method = %event.method,
                    uri = %event.uri,
                    retry_attempt = event.retry_attempt,
                    redirect = event.redirect,
                    "attempt started"
                )
            })
            .on_attempt_done(|event| {
                debug!(
                    method = %event.method,
                    uri = %event.uri,
                    retry_attempt = event.retry_attempt,
                    status = ?event.status.map(|status| status.as_u16()),
                    error = ?event.error,
                    elapsed_ms = event.elapsed.as_millis() as u64,
                    "attempt finished"
                )
            })
            .on_retry_wait(|event| {
                debug!(
                    method = %event.method,
                    uri = %event.uri,
                    retry_attempt = event.retry_attempt,
                    delay_ms = event.delay.as_millis() as u64,
                    "waiting before retry"
                )
            })
            .on_decode_start(|event| {
                debug!(
                    status = event.status.as_u16(),
                    content_type = ?event.content_type,
                    body_len = event.body_len,
                    "decoding response"
                )
            })
            .on_decode_done(|event| {
                debug!(status = event.status.as_u16(), error = ?event.error, "decoded response")
            })
            .with_connection(connection)
    }
}

/// Wraps a closure producing hooks into a shareable factory.
pub fn factory<F>(make: F) -> TraceFactory
where
    F: Fn() -> TraceHooks + Send + Sync + 'static,
{
    Arc::new(make)
}

pub fn logging_factory() -> TraceFactory {
    factory(TraceHooks::logging)
}

/// Builds the hooks for one send. Factories are in registration order; later
/// ones are newer and therefore run first.
pub(crate) fn compose_factories(factories: &[TraceFactory]) -> TraceHooks {
    factories
        .iter()
        .fold(TraceHooks::default(), |older, make| make().compose(older))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use http::Method;

    use super::{CallStart, DnsStart, TraceHooks, compose_factories, factory, fire};
    use crate::trace::ConnectionTrace;

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> TraceHooks {
        let call_log = Arc::clone(log);
        let dns_log = Arc::clone(log);
        TraceHooks::default()
            .on_call_start(move |_| call_log.lock().expect("log lock").push(format!("{name}:call")))
            .with_connection(ConnectionTrace::default().on_dns_start(move |_| {
                dns_log.lock().expect("log lock").push(format!("{name}:dns"))
            }))
    }

    fn call_start() -> CallStart {
        CallStart {
            method: Method::GET,
            uri: "https://example.com/".to_owned(),
        }
    }

    #[test]
    fn newer_hooks_run_before_older_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let merged = recording(&log, "t2").compose(recording(&log, "t1"));

        fire(&merged.call_start, call_start);
        fire(&merged.connection.dns_start, || DnsStart {
            host: "example.com".to_owned(),
        });

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["t2:call", "t1:call", "t2:dns", "t1:dns"]
        );
    }

    #[test]
    fn one_sided_slots_are_kept() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let merged = TraceHooks::default().compose(recording(&log, "only"));
        fire(&merged.call_start, call_start);
        assert!(merged.call_done.is_none());
        assert_eq!(*log.lock().expect("log lock"), vec!["only:call"]);
    }

    #[test]
    fn composing_empty_records_stays_empty() {
        let merged = TraceHooks::default().compose(TraceHooks::default());
        assert!(merged.is_empty());
        fire(&merged.call_start, || -> CallStart { panic!("event must not be built") });
    }

    #[test]
    fn factories_are_called_per_composition_newest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first_log = Arc::clone(&log);
        let second_log = Arc::clone(&log);
        let factories = vec![
            factory(move || recording(&first_log, "t1")),
            factory(move || recording(&second_log, "t2")),
        ];

        let hooks = compose_factories(&factories);
        fire(&hooks.call_start, call_start);
        assert_eq!(*log.lock().expect("log lock"), vec!["t2:call", "t1:call"]);
    }

    #[test]
    fn logging_hooks_fill_every_slot() {
        let hooks = TraceHooks::logging();
        assert!(hooks.call_start.is_some() && hooks.decode_done.is_some());
        assert!(hooks.connection.tls_done.is_some());
    }
}
