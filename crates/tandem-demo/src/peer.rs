//! Async driver executing handshake actions over in-process links.
//!
//! Each party owns one end of a [`Link`]. The driver feeds received bytes and
//! the current time into a [`Handshake`] and executes the returned actions:
//! wire bytes go out on the link, directory lookups are answered from the
//! shared [`Directory`], and waiting longer than the handshake timeout for
//! the next message aborts with `Timeout`.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tandem_core::{
    Bundle, CachedSecretStore, Directory, Environment, EstablishedSession, Handshake,
    HandshakeAction, HandshakeConfig, HandshakeError, HandshakeEvent, Identity, KeyPair, Sas,
    SasChannel,
};
use tokio::sync::mpsc;

use crate::{error::DemoError, system_env::SystemEnv};

/// One end of a bidirectional byte channel.
pub struct Link {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Link {
    /// Two connected ends.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self { tx: a_tx, rx: b_rx }, Self { tx: b_tx, rx: a_rx })
    }

    /// Send bytes to the other end.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), DemoError> {
        self.tx.send(bytes).await.map_err(|_| DemoError::LinkClosed)
    }

    /// Receive the next bytes, waiting at most `timeout`.
    ///
    /// `Ok(None)` on timeout.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, DemoError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => Err(DemoError::LinkClosed),
            Err(_) => Ok(None),
        }
    }
}

/// A party: identity, cached secrets and an optional published bundle key.
///
/// The store outlives individual handshakes, so a second handshake between
/// the same pair resumes.
#[derive(Clone)]
pub struct Peer {
    identity: Identity,
    store: CachedSecretStore,
    bundle_key: Option<Arc<KeyPair>>,
    env: SystemEnv,
    config: HandshakeConfig,
}

impl Peer {
    /// Create a party with an empty cached secret store.
    pub fn new(identity: Identity, config: HandshakeConfig) -> Self {
        Self { identity, store: CachedSecretStore::new(), bundle_key: None, env: SystemEnv, config }
    }

    /// Identity of this party.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Cached secrets of this party.
    pub fn store(&self) -> &CachedSecretStore {
        &self.store
    }

    /// Generate a bundle key and publish its public half.
    pub fn publish(&mut self, directory: &dyn Directory) {
        let key = KeyPair::from_secret_bytes(self.env.random_key());
        directory.publish_bundle(self.identity.clone(), Bundle {
            public_key: key.public_key(),
            locator: format!("local://{}", self.identity),
        });
        self.bundle_key = Some(Arc::new(key));
    }

    /// Run a handshake as initiator towards `target`.
    pub async fn initiate(
        &self,
        target: Identity,
        directory: &dyn Directory,
        first_message: Option<&[u8]>,
        link: &mut Link,
    ) -> Result<Outcome, DemoError> {
        let hs = Handshake::initiator(
            self.identity.clone(),
            self.store.clone(),
            self.env,
            self.config.clone(),
        );
        let mut driver = Driver::new(hs, link, self.config.timeout, self.env);
        driver.directory = Some((directory, first_message));

        let result = driver.hs.begin(target, self.env.now());
        driver.step(result).await?;
        driver.run().await
    }

    /// Wait for a handshake as responder.
    pub async fn respond(&self, link: &mut Link) -> Result<Outcome, DemoError> {
        let hs = Handshake::responder(
            self.identity.clone(),
            self.bundle_key.clone(),
            self.store.clone(),
            self.env,
            self.config.clone(),
        );
        Driver::new(hs, link, self.config.timeout, self.env).run().await
    }
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Outcome {
    /// The established session
    pub session: EstablishedSession,
    /// Provisional message received with Start (responder only)
    pub delivered: Option<Vec<u8>>,
    /// SAS shown to the user (first contact only)
    pub presented: Option<Sas>,
}

struct Driver<'a> {
    hs: Handshake<SystemEnv>,
    link: &'a mut Link,
    timeout: Duration,
    env: SystemEnv,
    directory: Option<(&'a dyn Directory, Option<&'a [u8]>)>,
    delivered: Option<Vec<u8>>,
    presented: Option<Sas>,
    session: Option<EstablishedSession>,
}

impl<'a> Driver<'a> {
    fn new(
        hs: Handshake<SystemEnv>,
        link: &'a mut Link,
        timeout: Duration,
        env: SystemEnv,
    ) -> Self {
        Self {
            hs,
            link,
            timeout,
            env,
            directory: None,
            delivered: None,
            presented: None,
            session: None,
        }
    }

    /// Receive and process messages until established.
    async fn run(mut self) -> Result<Outcome, DemoError> {
        loop {
            if let Some(session) = self.session.take() {
                return Ok(Outcome {
                    session,
                    delivered: self.delivered.take(),
                    presented: self.presented,
                });
            }

            let Some(bytes) = self.link.recv(self.timeout).await? else {
                let actions = self.hs.tick(self.env.now());
                self.execute(actions).await?;
                return Err(HandshakeError::Timeout { elapsed: self.timeout }.into());
            };

            let result = self.hs.handle_message(&bytes, self.env.now());
            self.step(result).await?;
        }
    }

    /// Execute the actions of one engine call, or report its failure.
    async fn step(
        &mut self,
        result: Result<Vec<HandshakeAction>, HandshakeError>,
    ) -> Result<(), DemoError> {
        match result {
            Ok(actions) => self.execute(actions).await,
            Err(error) => Err(self.report(error).await),
        }
    }

    /// Tell the peer why we aborted.
    async fn report(&mut self, error: HandshakeError) -> DemoError {
        if let Some(bytes) = self.hs.abort_message() {
            // Peer may already be gone
            let _ = self.link.send(bytes).await;
        }
        error.into()
    }

    async fn execute(&mut self, actions: Vec<HandshakeAction>) -> Result<(), DemoError> {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                HandshakeAction::Send(bytes) => self.link.send(bytes).await?,
                HandshakeAction::FetchBundle { peer } => {
                    let (bundle, first_message) = match self.directory {
                        Some((directory, first_message)) => {
                            (directory.fetch_bundle(&peer), first_message)
                        },
                        None => (None, None),
                    };
                    tracing::debug!(%peer, found = bundle.is_some(), "bundle lookup");

                    let now = self.env.now();
                    let result = self
                        .hs
                        .handle_bundle(bundle, first_message, now)
                        .and_then(|mut actions| {
                            actions.extend(self.hs.send_commit(now)?);
                            Ok(actions)
                        });
                    match result {
                        Ok(more) => queue.extend(more),
                        Err(error) => return Err(self.report(error).await),
                    }
                },
                HandshakeAction::DeliverProvisional { plaintext } => {
                    tracing::info!(bytes = plaintext.len(), "provisional message delivered");
                    self.delivered = Some(plaintext);
                },
                HandshakeAction::PresentSas { sas } => {
                    tracing::info!(%sas, "short authentication string");
                    self.presented = Some(sas);
                },
                HandshakeAction::Event(event) => match event {
                    HandshakeEvent::Began { role, .. } => tracing::debug!(?role, "began"),
                    HandshakeEvent::Accepted { role, .. } => tracing::debug!(?role, "accepted"),
                    HandshakeEvent::CachedSecretMismatch { role } => {
                        tracing::warn!(?role, "peer did not prove the cached secret");
                    },
                },
                HandshakeAction::Established { session_id, mode } => {
                    tracing::info!(session_id, ?mode, "session established");
                    self.session = self.hs.take_session();
                },
                HandshakeAction::Aborted { error } => return Err(error.into()),
            }
        }
        Ok(())
    }
}

/// SAS channel where the user has heard the peer's code read aloud.
pub struct ReadAloud {
    heard: Sas,
}

impl ReadAloud {
    /// The user heard `heard` from the peer.
    pub fn heard(heard: Sas) -> Self {
        Self { heard }
    }
}

impl SasChannel for ReadAloud {
    fn present_sas(&mut self, sas: Sas) {
        tracing::info!(%sas, "compare this code with your peer");
    }

    fn confirm_sas(&mut self, sas: Sas) -> bool {
        sas == self.heard
    }
}

/// Exchange `rounds` ping/pong messages between two established sessions.
///
/// Returns the plaintexts the responder received.
pub async fn converse(
    initiator: &mut EstablishedSession,
    initiator_link: &mut Link,
    responder: &mut EstablishedSession,
    responder_link: &mut Link,
    rounds: u32,
) -> Result<Vec<Vec<u8>>, DemoError> {
    let mut received = Vec::new();

    for round in 0..rounds {
        initiator_link.send(initiator.seal(format!("ping {round}").as_bytes())?).await?;
        let Some(bytes) = responder_link.recv(Duration::from_secs(1)).await? else {
            return Err(DemoError::LinkClosed);
        };
        received.push(responder.open(&bytes)?);

        responder_link.send(responder.seal(format!("pong {round}").as_bytes())?).await?;
        let Some(bytes) = initiator_link.recv(Duration::from_secs(1)).await? else {
            return Err(DemoError::LinkClosed);
        };
        let reply = initiator.open(&bytes)?;
        tracing::debug!(round, bytes = reply.len(), "reply received");
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use tandem_core::{
        ErrorKind, HandshakeMode, IdentityPair, MemoryDirectory, SasVerification,
    };

    use super::*;

    fn parties(config: HandshakeConfig, directory: &MemoryDirectory) -> (Peer, Peer) {
        let alice = Peer::new("alice".into(), config.clone());
        let mut bob = Peer::new("bob".into(), config);
        bob.publish(directory);
        (alice, bob)
    }

    async fn handshake(
        alice: &Peer,
        bob: &Peer,
        directory: &MemoryDirectory,
        first_message: Option<&[u8]>,
        links: (&mut Link, &mut Link),
    ) -> (Result<Outcome, DemoError>, Result<Outcome, DemoError>) {
        let (alice_link, bob_link) = links;
        tokio::join!(
            alice.initiate(bob.identity().clone(), directory, first_message, alice_link),
            bob.respond(bob_link),
        )
    }

    #[tokio::test]
    async fn first_contact_then_resumption() {
        let directory = MemoryDirectory::new();
        let (alice, bob) = parties(HandshakeConfig::default(), &directory);
        let (mut alice_link, mut bob_link) = Link::pair(8);

        let (a, b) =
            handshake(&alice, &bob, &directory, Some(b"hi"), (&mut alice_link, &mut bob_link))
                .await;
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        assert_eq!(b.delivered.as_deref(), Some(b"hi".as_slice()));
        assert_eq!(a.presented, b.presented);
        assert_eq!(a.session.mode(), HandshakeMode::FirstContact);

        let heard_by_alice = b.session.sas();
        let heard_by_bob = a.session.sas();
        a.session.confirm_sas(&mut ReadAloud::heard(heard_by_alice));
        b.session.confirm_sas(&mut ReadAloud::heard(heard_by_bob));
        assert_eq!(a.session.verification(), SasVerification::Verified);

        let received =
            converse(&mut a.session, &mut alice_link, &mut b.session, &mut bob_link, 3)
                .await
                .unwrap();
        assert_eq!(received, vec![b"ping 0".to_vec(), b"ping 1".to_vec(), b"ping 2".to_vec()]);

        let (a, b) =
            handshake(&alice, &bob, &directory, None, (&mut alice_link, &mut bob_link)).await;
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.session.mode(), HandshakeMode::Resumption);
        assert!(a.presented.is_none());
        converse(&mut a.session, &mut alice_link, &mut b.session, &mut bob_link, 1)
            .await
            .unwrap();

        let pair = IdentityPair::new("alice".into(), "bob".into());
        assert_eq!(alice.store().get(&pair), bob.store().get(&pair));
    }

    #[tokio::test]
    async fn silent_responder_times_out() {
        let config =
            HandshakeConfig { timeout: Duration::from_millis(50), ..HandshakeConfig::default() };
        let directory = MemoryDirectory::new();
        let (alice, bob) = parties(config, &directory);
        let (mut alice_link, _bob_link) = Link::pair(8);

        let err = alice
            .initiate(bob.identity().clone(), &directory, None, &mut alice_link)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        let pair = IdentityPair::new("alice".into(), "bob".into());
        assert!(!alice.store().is_leased(&pair));
    }

    #[tokio::test]
    async fn dropped_link_is_reported() {
        let directory = MemoryDirectory::new();
        let (_, bob) = parties(HandshakeConfig::default(), &directory);
        let (alice_link, mut bob_link) = Link::pair(8);
        drop(alice_link);

        let err = bob.respond(&mut bob_link).await.unwrap_err();
        assert!(matches!(err, DemoError::LinkClosed));
    }
}
