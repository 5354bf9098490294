//! Single-use registration tickets bound to the requesting client.
//!
//! A ticket is minted when the registration page is served and must be
//! redeemed by the same client (IP address and user agent) before it
//! expires. Redemption follows a small state machine:
//!
//! ```text
//! Issued --(same client, within TTL)--> Consumed
//! Issued --(TTL elapsed)--------------> Rejected (ticket deleted)
//! Issued --(different client)---------> Rejected (ticket kept for retry)
//! ```
//!
//! Tickets are not persisted; a restart clears them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::token::{registration_token, TokenError};

/// Default ticket lifetime: 5 minutes.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(300);

/// Errors raised while redeeming a registration ticket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// No ticket with this token exists (never issued or already consumed).
    #[error("invalid registration token")]
    InvalidToken,

    /// The ticket existed but its TTL had elapsed. It has been deleted.
    #[error("registration token expired")]
    TokenExpired,

    /// The redeeming client differs from the issuing client.
    #[error("registration token was issued to a different client")]
    ClientMismatch,
}

/// Identity of the client that requested or redeems a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Ticket {
    client: ClientInfo,
    expires_at: Instant,
}

impl Ticket {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A ticket taken out of the book by [`TicketBook::redeem`].
#[derive(Debug)]
pub struct Redeemed {
    token: String,
    ticket: Ticket,
}

/// Thread-safe table of outstanding registration tickets.
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct TicketBook {
    tickets: Arc<RwLock<HashMap<String, Ticket>>>,
    ttl: Duration,
}

impl TicketBook {
    /// Creates an empty book with the default 5-minute TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TICKET_TTL)
    }

    /// Creates an empty book with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tickets: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Mints a ticket for `client` and returns its token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if the entropy source fails.
    pub fn issue(&self, client: ClientInfo) -> Result<String, TokenError> {
        let token = registration_token()?;
        let ticket = Ticket {
            client,
            expires_at: Instant::now() + self.ttl,
        };
        trace!(ip = %ticket.client.ip, "Issued registration ticket");
        self.write().insert(token.clone(), ticket);
        Ok(token)
    }

    /// Checks and removes `token` in one step.
    ///
    /// Check and removal happen under one lock, so of several concurrent
    /// redemptions of a ticket at most one succeeds. An expired ticket is
    /// deleted. A client mismatch leaves the ticket in place so the rightful
    /// client can still use it.
    pub fn redeem(&self, token: &str, client: &ClientInfo) -> Result<Redeemed, TicketError> {
        let mut tickets = self.write();
        match tickets.get(token) {
            None => Err(TicketError::InvalidToken),
            Some(ticket) if ticket.is_expired() => {
                tickets.remove(token);
                debug!("Rejected expired registration ticket");
                Err(TicketError::TokenExpired)
            }
            Some(ticket) if ticket.client != *client => {
                debug!(
                    issued_ip = %ticket.client.ip,
                    request_ip = %client.ip,
                    "Registration ticket presented by a different client"
                );
                Err(TicketError::ClientMismatch)
            }
            Some(_) => {
                let ticket = tickets.remove(token).ok_or(TicketError::InvalidToken)?;
                Ok(Redeemed {
                    token: token.to_string(),
                    ticket,
                })
            }
        }
    }

    /// Puts a redeemed ticket back, keeping its original expiry.
    ///
    /// Used when the registration it was redeemed for fails. An already
    /// expired ticket is dropped instead.
    pub fn restore(&self, redeemed: Redeemed) {
        if redeemed.ticket.is_expired() {
            return;
        }
        trace!("Restored registration ticket");
        self.write().insert(redeemed.token, redeemed.ticket);
    }

    /// Removes all expired tickets and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut tickets = self.write();
        let initial = tickets.len();
        tickets.retain(|_, ticket| !ticket.is_expired());
        initial - tickets.len()
    }

    /// Returns the number of outstanding tickets.
    pub fn len(&self) -> usize {
        self.tickets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no tickets are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured ticket lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Spawns a background task that purges expired tickets every
    /// `cleanup_interval`. The task runs until the returned handle is aborted
    /// or the runtime shuts down.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let book = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = book.purge_expired();
                if removed > 0 {
                    debug!(removed_count = removed, "Purged expired registration tickets");
                }
            }
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Ticket>> {
        self.tickets.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TicketBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TicketBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketBook")
            .field("outstanding", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
