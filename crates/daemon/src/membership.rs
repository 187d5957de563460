//! Client registry, heartbeat stamps, and reverse channels.
//!
//! Registration spawns one monitor thread per client. The monitor polls at
//! a quarter of the heartbeat interval and reaps the client once its stamp
//! lapses past the full interval: the membership entry and the cached
//! reverse channel are dropped, and the thread exits. A generation counter
//! keeps a stale monitor from reaping a client that re-registered after an
//! earlier reap.
//!
//! Reaping never touches the directory's owner lists; resolution discovers
//! dead owners lazily by failing to reach them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use protocol::{Caller, ClientId, Fault, FaultCode};

pub(crate) struct Membership {
    interval: Duration,
    next_generation: AtomicU64,
    clients: Mutex<FxHashMap<ClientId, Entry>>,
}

struct Entry {
    last_heartbeat: Instant,
    generation: u64,
    reverse: Option<Arc<Caller>>,
}

impl Membership {
    pub(crate) fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            next_generation: AtomicU64::new(0),
            clients: Mutex::new(FxHashMap::default()),
        })
    }

    /// Admits `client` and starts its monitor. Faults on duplicates.
    pub(crate) fn register(self: &Arc<Self>, client: ClientId) -> Result<(), Fault> {
        let generation = {
            let mut clients = self.clients.lock().expect("membership lock");
            if clients.contains_key(&client) {
                return Err(Fault::new(
                    FaultCode::AlreadyRegistered,
                    client.to_string(),
                ));
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            clients.insert(
                client.clone(),
                Entry {
                    last_heartbeat: Instant::now(),
                    generation,
                    reverse: None,
                },
            );
            generation
        };

        info!(%client, "client registered");
        let membership = Arc::clone(self);
        let monitored = client.clone();
        let spawned = thread::Builder::new()
            .name("monitor".into())
            .spawn(move || membership.monitor(&monitored, generation));
        if let Err(error) = spawned {
            warn!(%client, %error, "failed to spawn monitor thread");
        }
        Ok(())
    }

    /// Removes `client`. Unknown clients are fine: teardown is idempotent.
    pub(crate) fn unregister(&self, client: &ClientId) {
        let removed = {
            let mut clients = self.clients.lock().expect("membership lock");
            clients.remove(client)
        };
        if removed.is_some() {
            info!(%client, "client unregistered");
        }
    }

    /// Refreshes the liveness stamp. Faults for unknown clients.
    pub(crate) fn heartbeat(&self, client: &ClientId) -> Result<(), Fault> {
        let mut clients = self.clients.lock().expect("membership lock");
        match clients.get_mut(client) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(Fault::new(FaultCode::NotRegistered, client.to_string())),
        }
    }

    pub(crate) fn is_registered(&self, client: &ClientId) -> bool {
        let clients = self.clients.lock().expect("membership lock");
        clients.contains_key(client)
    }

    /// Caches the reverse channel established by dialing `client` back.
    pub(crate) fn set_reverse(&self, client: &ClientId, caller: Caller) -> Result<(), Fault> {
        let mut clients = self.clients.lock().expect("membership lock");
        match clients.get_mut(client) {
            Some(entry) => {
                entry.reverse = Some(Arc::new(caller));
                Ok(())
            }
            None => Err(Fault::new(FaultCode::NotRegistered, client.to_string())),
        }
    }

    /// The reverse channel for `client`, when it is registered and one was
    /// established.
    pub(crate) fn reverse(&self, client: &ClientId) -> Option<Arc<Caller>> {
        let clients = self.clients.lock().expect("membership lock");
        clients.get(client).and_then(|entry| entry.reverse.clone())
    }

    fn monitor(&self, client: &ClientId, generation: u64) {
        let poll = (self.interval / 4).max(Duration::from_millis(1));
        loop {
            thread::sleep(poll);
            let mut clients = self.clients.lock().expect("membership lock");
            match clients.get(client) {
                // Unregistered, or re-registered under a newer generation:
                // this monitor is obsolete either way.
                None => return,
                Some(entry) if entry.generation != generation => return,
                Some(entry) if entry.last_heartbeat.elapsed() > self.interval => {
                    clients.remove(client);
                    warn!(%client, "client reaped after missed heartbeats");
                    return;
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(tag: &str) -> ClientId {
        ClientId::new(format!("127.0.0.1:{tag}"), format!("/mnt/{tag}"))
    }

    fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if ready() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        ready()
    }

    #[test]
    fn duplicate_registration_faults() {
        let membership = Membership::new(Duration::from_secs(5));
        let client = test_client("7001");

        membership.register(client.clone()).expect("first register");
        let err = membership
            .register(client.clone())
            .expect_err("duplicate register");
        assert_eq!(err.code, FaultCode::AlreadyRegistered);
        assert!(membership.is_registered(&client));
    }

    #[test]
    fn heartbeat_from_an_unknown_client_faults() {
        let membership = Membership::new(Duration::from_secs(5));
        let err = membership
            .heartbeat(&test_client("7002"))
            .expect_err("unknown client");
        assert_eq!(err.code, FaultCode::NotRegistered);
    }

    #[test]
    fn silent_clients_are_reaped_within_the_interval() {
        let membership = Membership::new(Duration::from_millis(80));
        let client = test_client("7003");
        membership.register(client.clone()).expect("register");

        assert!(
            wait_until(Duration::from_millis(500), || !membership
                .is_registered(&client)),
            "client was never reaped"
        );
    }

    #[test]
    fn heartbeats_keep_a_client_alive() {
        let membership = Membership::new(Duration::from_millis(120));
        let client = test_client("7004");
        membership.register(client.clone()).expect("register");

        for _ in 0..6 {
            thread::sleep(Duration::from_millis(40));
            membership.heartbeat(&client).expect("heartbeat");
        }
        assert!(membership.is_registered(&client));
    }

    #[test]
    fn a_reaped_client_can_register_again() {
        let membership = Membership::new(Duration::from_millis(60));
        let client = test_client("7005");
        membership.register(client.clone()).expect("register");

        assert!(wait_until(Duration::from_millis(400), || !membership
            .is_registered(&client)));

        membership.register(client.clone()).expect("re-register");
        // The fresh registration must survive its own interval when fed.
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(20));
            membership.heartbeat(&client).expect("heartbeat");
        }
        assert!(membership.is_registered(&client));
    }
}
