//! Transaction layer tests: key derivation and the timer-driven state
//! machines, exercised over loopback UDP.

mod test_key;
mod test_transaction;
