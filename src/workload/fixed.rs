//! Fixed-URI generator, ported from `uri_fixed.c`: every call gets the same
//! configured URI.

use crate::model::Request;
use crate::workload::WorkloadGenerator;

pub struct FixedUriGenerator {
    uri: Vec<u8>,
}

impl FixedUriGenerator {
    pub fn new(uri: impl Into<Vec<u8>>) -> Self {
        FixedUriGenerator { uri: uri.into() }
    }
}

impl WorkloadGenerator for FixedUriGenerator {
    fn populate(&mut self, request: &mut Request) -> bool {
        request.uri = self.uri.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolVersion;

    #[test]
    fn every_call_gets_the_same_uri() {
        let mut gen = FixedUriGenerator::new("/index.html");
        let mut a = Request::new("GET", "/", ProtocolVersion::Http11);
        let mut b = Request::new("GET", "/", ProtocolVersion::Http11);
        assert!(gen.populate(&mut a));
        assert!(gen.populate(&mut b));
        assert_eq!(a.uri, b.uri);
        assert_eq!(a.uri, b"/index.html");
    }
}
