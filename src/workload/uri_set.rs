//! Working-set generator for `--wset=N,P`, ported from `uri_wset.c`: cycles
//! through `num_files` numbered documents under a common prefix, injecting a
//! "miss" (jump ahead by the number of cooperating clients) at the
//! configured rate so that concurrent load generators don't all hit the
//! same file at the same time.

use crate::model::Request;
use crate::workload::WorkloadGenerator;

pub struct UriSetGenerator {
    prefix: Vec<u8>,
    num_files: u32,
    target_miss_rate: f64,
    num_clients: u32,
    miss_prob: f64,
    file_num: u32,
}

impl UriSetGenerator {
    /// `prefix` is `param.uri` with any trailing `/` stripped, matching the
    /// original's adjustment in `uri_wset.c`'s `init`.
    pub fn new(prefix: &str, num_files: u32, target_miss_rate: f64, client_id: u32, num_clients: u32) -> Self {
        let prefix = prefix.strip_suffix('/').unwrap_or(prefix).as_bytes().to_vec();
        UriSetGenerator {
            prefix,
            num_files: num_files.max(1),
            target_miss_rate,
            num_clients: num_clients.max(1),
            miss_prob: 0.0,
            file_num: client_id % num_files.max(1),
        }
    }

    fn advance(&mut self) {
        self.miss_prob += self.target_miss_rate;
        if self.miss_prob >= 1.0 {
            self.miss_prob -= 1.0;
            self.file_num += self.num_clients;
            if self.file_num >= self.num_files {
                self.file_num -= self.num_files;
            }
        }
    }
}

impl WorkloadGenerator for UriSetGenerator {
    fn populate(&mut self, request: &mut Request) -> bool {
        self.advance();
        let mut uri = self.prefix.clone();
        uri.push(b'/');
        uri.extend_from_slice(self.file_num.to_string().as_bytes());
        uri.extend_from_slice(b".html");
        request.uri = uri;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolVersion;

    #[test]
    fn zero_miss_rate_repeats_the_same_file() {
        let mut gen = UriSetGenerator::new("/docs", 100, 0.0, 0, 1);
        let mut req = Request::new("GET", "/", ProtocolVersion::Http11);
        gen.populate(&mut req);
        let first = req.uri.clone();
        gen.populate(&mut req);
        assert_eq!(req.uri, first);
    }

    #[test]
    fn full_miss_rate_advances_every_call() {
        let mut gen = UriSetGenerator::new("/docs", 100, 1.0, 0, 1);
        let mut req = Request::new("GET", "/", ProtocolVersion::Http11);
        gen.populate(&mut req);
        let first = req.uri.clone();
        gen.populate(&mut req);
        assert_ne!(req.uri, first);
    }

    #[test]
    fn file_number_wraps_within_the_set() {
        let mut gen = UriSetGenerator::new("/docs", 3, 1.0, 0, 1);
        let mut req = Request::new("GET", "/", ProtocolVersion::Http11);
        for _ in 0..10 {
            gen.populate(&mut req);
            assert!(gen.file_num < 3);
        }
    }
}
