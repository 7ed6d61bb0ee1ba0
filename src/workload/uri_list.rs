//! URI-list generator for `--wlog`, ported from `uri_wlog.c`: a file of
//! concatenated NUL-terminated URIs, consumed in order, optionally looping.
//! The original `mmap`s the file and walks raw pointers; reading it into one
//! owned buffer up front gives the same "no per-call parsing" property
//! without unsafe code.

use std::fs;
use std::io;
use std::path::Path;

use crate::model::Request;
use crate::workload::WorkloadGenerator;

pub struct UriListGenerator {
    uris: Vec<Vec<u8>>,
    next: usize,
    do_loop: bool,
}

impl UriListGenerator {
    pub fn from_file(path: impl AsRef<Path>, do_loop: bool) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "wlog file is empty"));
        }
        let uris = bytes
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_vec())
            .collect::<Vec<_>>();
        if uris.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "wlog file has no URIs"));
        }
        Ok(UriListGenerator { uris, next: 0, do_loop })
    }
}

impl WorkloadGenerator for UriListGenerator {
    fn populate(&mut self, request: &mut Request) -> bool {
        if self.next >= self.uris.len() {
            if !self.do_loop {
                return false;
            }
            self.next = 0;
        }
        request.uri = self.uris[self.next].clone();
        self.next += 1;
        true
    }
}
