//! Two engines talking over an in-memory wire

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use tftpmux::tftp::transport::{BlockingTask, PeriodicTask, Receiver};
use tftpmux::tftp::{
    EngineConfig, Endpoint, FailureReason, Scheduler, TaskHandle, TransferEngine, TransferFailure,
};

/// Datagrams in flight plus the receivers registered at each address
#[derive(Default)]
struct Wire {
    in_flight: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    receivers: Mutex<HashMap<SocketAddr, Vec<(Vec<u8>, Receiver)>>>,
}

impl Wire {
    /// Deliver datagrams until the wire is quiet. Returns how many were delivered.
    fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some((from, to, bytes)) = self.in_flight.lock().pop_front() else {
                return delivered;
            };
            let receiver = self.receivers.lock().get(&to).and_then(|list| {
                list.iter()
                    .find(|(prefix, _)| bytes.starts_with(prefix))
                    .map(|(prefix, receiver)| (prefix.len(), receiver.clone()))
            });
            if let Some((prefix_len, receiver)) = receiver {
                receiver(from, &bytes[prefix_len..]);
                delivered += 1;
            }
        }
    }
}

struct WireEndpoint {
    wire: Arc<Wire>,
    local: SocketAddr,
}

impl Endpoint for WireEndpoint {
    fn send_packet(&self, peer: SocketAddr, data: &[u8], prefix: &[u8]) -> io::Result<()> {
        let mut bytes = prefix.to_vec();
        bytes.extend_from_slice(data);
        self.wire.in_flight.lock().push_back((self.local, peer, bytes));
        Ok(())
    }

    fn listen_to(&self, prefix: &[u8], receiver: Receiver) {
        self.wire
            .receivers
            .lock()
            .entry(self.local)
            .or_default()
            .push((prefix.to_vec(), receiver));
    }
}

/// Sweeps are driven by hand through `check_timeout_at`; blocking work runs inline
struct IdleScheduler;

impl Scheduler for IdleScheduler {
    fn schedule_periodic(&self, _name: &str, _interval: Duration, _task: PeriodicTask) -> TaskHandle {
        TaskHandle::detached()
    }

    fn spawn_blocking(&self, task: BlockingTask) {
        task();
    }
}

struct Node {
    addr: SocketAddr,
    root: TempDir,
    engine: Arc<TransferEngine>,
}

impl Node {
    fn new(wire: &Arc<Wire>, addr: &str, block_size: u16) -> Self {
        let addr: SocketAddr = addr.parse().unwrap();
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(root.path().to_path_buf()).with_block_size(block_size);
        let endpoint = Arc::new(WireEndpoint {
            wire: wire.clone(),
            local: addr,
        });
        let engine = TransferEngine::new(config, endpoint, Arc::new(IdleScheduler));
        engine.start().unwrap();
        Self { addr, root, engine }
    }

    fn write(&self, name: &str, data: &[u8]) {
        let path = self.root.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

type Results = Arc<Mutex<Vec<(String, Result<Vec<u8>, TransferFailure>)>>>;

fn download(from: &Node, to: &Node, name: &str, results: &Results) {
    let ok = results.clone();
    let err = results.clone();
    let label = name.to_string();
    to.engine.initiate_download(
        name,
        from.addr,
        Some(Box::new(move |data: Vec<u8>| ok.lock().push((label, Ok(data))))),
        Some(Box::new(move |failure: TransferFailure| {
            err.lock().push((failure.file_name.clone(), Err(failure)))
        })),
    );
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn test_file_download_in_both_directions() {
    let wire = Arc::new(Wire::default());
    let a = Node::new(&wire, "10.0.0.1:6969", 512);
    let b = Node::new(&wire, "10.0.0.2:6969", 1024);
    a.write("firmware.bin", &patterned(5000));
    b.write("notes/readme.txt", b"hello from b");

    let results: Results = Arc::default();
    download(&a, &b, "firmware.bin", &results);
    wire.pump();
    download(&b, &a, "notes/readme.txt", &results);
    wire.pump();

    let results = results.lock();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "firmware.bin");
    assert_eq!(results[0].1.as_ref().unwrap(), &patterned(5000));
    assert_eq!(results[1].1.as_ref().unwrap(), b"hello from b");

    assert_eq!(a.engine.queue_len(&b.addr), 0);
    assert_eq!(b.engine.queue_len(&a.addr), 0);
}

#[test]
fn test_requested_blksize_is_honoured() {
    let wire = Arc::new(Wire::default());
    let server = Node::new(&wire, "10.0.0.1:6969", 512);
    let client = Node::new(&wire, "10.0.0.2:6969", 8);
    server.write("small.txt", b"0123456789abcdef0123");

    let results: Results = Arc::default();
    download(&server, &client, "small.txt", &results);
    // RRQ, OACK, ACK 0, then 3 DATA/ACK pairs for 20 bytes in 8 byte blocks
    assert_eq!(wire.pump(), 9);

    assert_eq!(results.lock()[0].1.as_ref().unwrap(), b"0123456789abcdef0123");
}

#[test]
fn test_directory_download_unpacks() {
    let wire = Arc::new(Wire::default());
    let server = Node::new(&wire, "10.0.0.1:6969", 512);
    let client = Node::new(&wire, "10.0.0.2:6969", 512);
    server.write("photos/a.jpg", &patterned(1500));
    server.write("photos/trip/b.jpg", b"b");

    let results: Results = Arc::default();
    download(&server, &client, "dir:photos", &results);
    wire.pump();

    let results = results.lock();
    let archive = results[0].1.as_ref().unwrap();
    let mut unpacked = tar::Archive::new(archive.as_slice());
    let mut files = HashMap::new();
    for entry in unpacked.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type().is_file() {
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.insert(path, data);
        }
    }
    assert_eq!(files.len(), 2);
    assert_eq!(files["photos/a.jpg"], patterned(1500));
    assert_eq!(files["photos/trip/b.jpg"], b"b");
}

#[test]
fn test_queued_downloads_complete_in_order() {
    let wire = Arc::new(Wire::default());
    let server = Node::new(&wire, "10.0.0.1:6969", 512);
    let client = Node::new(&wire, "10.0.0.2:6969", 512);
    for (name, len) in [("one", 10), ("two", 1024), ("three", 700)] {
        server.write(name, &patterned(len));
    }

    let results: Results = Arc::default();
    for name in ["one", "two", "three"] {
        download(&server, &client, name, &results);
    }
    assert_eq!(client.engine.queue_len(&server.addr), 3);
    wire.pump();

    let results = results.lock();
    let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["one", "two", "three"]);
    assert_eq!(results[1].1.as_ref().unwrap().len(), 1024);
    assert_eq!(client.engine.queue_len(&server.addr), 0);
}

#[test]
fn test_missing_file_times_out_on_client() {
    let wire = Arc::new(Wire::default());
    let server = Node::new(&wire, "10.0.0.1:6969", 512);
    let client = Node::new(&wire, "10.0.0.2:6969", 512);

    let results: Results = Arc::default();
    download(&server, &client, "missing.bin", &results);
    // The request is dropped without an answer
    assert_eq!(wire.pump(), 1);
    assert!(results.lock().is_empty());

    client.engine.check_timeout_at(Instant::now() + Duration::from_secs(6));

    let results = results.lock();
    let failure = results[0].1.as_ref().unwrap_err();
    assert_eq!(failure.file_name, "missing.bin");
    assert_eq!(failure.reason, FailureReason::PeerTimeout);
}

#[test]
fn test_traversal_is_refused() {
    let wire = Arc::new(Wire::default());
    let server = Node::new(&wire, "10.0.0.1:6969", 512);
    let client = Node::new(&wire, "10.0.0.2:6969", 512);
    server.write("inside.txt", b"ok");

    let results: Results = Arc::default();
    download(&server, &client, "../inside.txt", &results);
    download(&server, &client, "inside.txt", &results);
    wire.pump();
    assert!(results.lock().is_empty());

    // The refused request holds the queue until it expires, then the next one runs
    client.engine.check_timeout_at(Instant::now() + Duration::from_secs(6));
    wire.pump();

    let results = results.lock();
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_err());
    assert_eq!(results[1].1.as_ref().unwrap(), b"ok");
}
