//! UA core tests: the UAS validation pipeline and full loopback
//! request/response scenarios between two endpoints.

mod test_pipeline;
mod test_ua;
