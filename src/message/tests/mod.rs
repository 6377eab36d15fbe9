//! Codec tests: URIs, headers and message framing.

mod test_parser;
mod test_uri;
