//! Transaction layer: the four RFC 3261 section 17 state machines, their
//! timers, transaction keys and the endpoint that demultiplexes traffic
//! onto them.

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;

#[cfg(test)]
mod tests;

use key::TransactionKey;
use rand::Rng;
use std::time::Duration;

/// The branch parameter prefix that marks RFC 3261 transaction ids on the
/// wire.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Timer events, named per RFC 3261 Table 4. Retransmission timers carry
/// their current interval so it can double on each firing.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    /// INVITE client retransmission (UDP only).
    TimerA(TransactionKey, Duration),
    /// INVITE client timeout, 64*T1.
    TimerB(TransactionKey),
    /// INVITE client wait for response retransmissions.
    TimerD(TransactionKey),
    /// non-INVITE client retransmission, capped at T2 (UDP only).
    TimerE(TransactionKey, Duration),
    /// non-INVITE client timeout, 64*T1.
    TimerF(TransactionKey),
    /// INVITE server final response retransmission, capped at T2 (UDP only).
    TimerG(TransactionKey, Duration),
    /// INVITE server wait for ACK, 64*T1.
    TimerH(TransactionKey),
    /// INVITE server wait for ACK retransmissions, T4.
    TimerI(TransactionKey),
    /// non-INVITE server wait for request retransmissions, 64*T1.
    TimerJ(TransactionKey),
    /// non-INVITE client wait for response retransmissions, T4.
    TimerK(TransactionKey),
    /// Deadline for the automatic 100 Trying on an INVITE server
    /// transaction.
    TimerTrying(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerTrying(key) => key,
        }
    }
}

const TAG_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_string(len: usize, alphabet: &[u8]) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

/// A fresh From/To tag: 16 alphabetic characters, well over the 32 bits of
/// entropy RFC 3261 section 19.3 asks for.
pub fn make_tag() -> String {
    random_string(16, TAG_ALPHABET)
}

/// A fresh Via branch carrying the magic cookie.
pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_string(16, TOKEN_ALPHABET))
}

/// A fresh globally-unique Call-ID, optionally qualified with a host
/// suffix.
pub fn make_call_id(domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}@{}", random_string(22, TOKEN_ALPHABET), domain),
        None => random_string(22, TOKEN_ALPHABET),
    }
}
