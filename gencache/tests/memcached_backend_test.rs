//! Memcached backend tests against an in-process node.
//!
//! The node answers both the binary and the ASCII protocol and follows
//! memcached's counter rules: a binary `incr` whose expiration is not
//! `0xffffffff` creates the missing key from its initial value, an ASCII
//! `incr` on a missing key answers `NOT_FOUND`.

#![cfg(feature = "memcached")]

use gencache::*;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

const BINARY_REQUEST: u8 = 0x80;
const BINARY_RESPONSE: u8 = 0x81;

const STATUS_OK: u16 = 0x00;
const STATUS_NOT_FOUND: u16 = 0x01;
const STATUS_EXISTS: u16 = 0x02;
const STATUS_NON_NUMERIC: u16 = 0x06;
const STATUS_UNKNOWN_COMMAND: u16 = 0x81;

type Items = Arc<Mutex<HashMap<String, String>>>;

struct Node {
    address: String,
    items: Items,
}

impl Node {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let items: Items = Arc::default();

        let shared = items.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let items = shared.clone();
                thread::spawn(move || serve(stream, items));
            }
        });

        Self { address, items }
    }

    fn contains(&self, key: &str) -> bool {
        self.items.lock().unwrap().contains_key(key)
    }
}

fn serve(stream: TcpStream, items: Items) {
    let mut first = [0u8; 1];
    match stream.peek(&mut first) {
        Ok(1) if first[0] == BINARY_REQUEST => serve_binary(stream, items),
        Ok(1) => serve_ascii(stream, items),
        _ => {}
    }
}

fn serve_binary(mut stream: TcpStream, items: Items) {
    loop {
        let mut header = [0u8; 24];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = [header[12], header[13], header[14], header[15]];

        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        let extras = &body[..extras_len];
        let key = String::from_utf8_lossy(&body[extras_len..extras_len + key_len]).into_owned();
        let value = String::from_utf8_lossy(&body[extras_len + key_len..]).into_owned();

        let (status, extras_out, value_out) = binary_command(opcode, &key, extras, value, &items);

        let mut response = vec![BINARY_RESPONSE, opcode, 0, 0, extras_out.len() as u8, 0];
        response.extend_from_slice(&status.to_be_bytes());
        response.extend_from_slice(&((extras_out.len() + value_out.len()) as u32).to_be_bytes());
        response.extend_from_slice(&opaque);
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&extras_out);
        response.extend_from_slice(&value_out);
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn binary_command(
    opcode: u8,
    key: &str,
    extras: &[u8],
    value: String,
    items: &Items,
) -> (u16, Vec<u8>, Vec<u8>) {
    let mut items = items.lock().unwrap();
    let done = (STATUS_OK, Vec::new(), Vec::new());
    let failed = |status: u16| -> (u16, Vec<u8>, Vec<u8>) { (status, Vec::new(), Vec::new()) };

    match opcode {
        // get
        0x00 => match items.get(key) {
            Some(value) => (STATUS_OK, vec![0; 4], value.clone().into_bytes()),
            None => failed(STATUS_NOT_FOUND),
        },
        // set
        0x01 => {
            items.insert(key.to_string(), value);
            done
        }
        // add
        0x02 if items.contains_key(key) => failed(STATUS_EXISTS),
        0x02 => {
            items.insert(key.to_string(), value);
            done
        }
        // replace
        0x03 if !items.contains_key(key) => failed(STATUS_NOT_FOUND),
        0x03 => {
            items.insert(key.to_string(), value);
            done
        }
        // delete
        0x04 => match items.remove(key) {
            Some(_) => done,
            None => failed(STATUS_NOT_FOUND),
        },
        // incr, decr
        0x05 | 0x06 => {
            let amount = u64::from_be_bytes(extras[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
            let expiration = u32::from_be_bytes(extras[16..20].try_into().unwrap());

            let next = match items.get(key) {
                None if expiration == u32::MAX => return failed(STATUS_NOT_FOUND),
                None => initial,
                Some(current) => match current.parse::<u64>() {
                    Ok(current) if opcode == 0x05 => current.wrapping_add(amount),
                    Ok(current) => current.saturating_sub(amount),
                    Err(_) => return failed(STATUS_NON_NUMERIC),
                },
            };
            items.insert(key.to_string(), next.to_string());
            (STATUS_OK, Vec::new(), next.to_be_bytes().to_vec())
        }
        // version
        0x0b => (STATUS_OK, Vec::new(), b"1.6.0".to_vec()),
        _ => failed(STATUS_UNKNOWN_COMMAND),
    }
}

fn serve_ascii(stream: TcpStream, items: Items) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let reply = ascii_command(line.split_whitespace().collect(), &items);
        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

fn ascii_command(words: Vec<&str>, items: &Items) -> String {
    let mut items = items.lock().unwrap();

    match words.as_slice() {
        ["version"] => "VERSION 1.6.0\r\n".to_string(),
        [command @ ("incr" | "decr"), key, amount] => {
            let amount: u64 = amount.parse().unwrap_or(0);
            let Some(current) = items.get(*key) else {
                return "NOT_FOUND\r\n".to_string();
            };
            let Ok(current) = current.parse::<u64>() else {
                return "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                    .to_string();
            };
            let next = if *command == "incr" {
                current.wrapping_add(amount)
            } else {
                current.saturating_sub(amount)
            };
            items.insert(key.to_string(), next.to_string());
            format!("{}\r\n", next)
        }
        _ => "ERROR\r\n".to_string(),
    }
}

async fn connect(node: &Node) -> MemcachedBackend {
    let nodes = vec![NodeAddress::parse(&node.address).unwrap()];
    MemcachedBackend::connect("default", &nodes, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_counters_on_missing_key_report_none() {
    let node = Node::start();
    let backend = connect(&node).await;

    assert_eq!(backend.increment("never-set", 5).await.unwrap(), None);
    assert_eq!(backend.decrement("never-set", 5).await.unwrap(), None);
    assert!(!node.contains("never-set"));
    assert_eq!(backend.get("never-set").await.unwrap(), None);
}

#[tokio::test]
async fn test_counters_on_existing_key() {
    let node = Node::start();
    let backend = connect(&node).await;

    backend.set("hits", "5", None).await.unwrap();
    assert_eq!(backend.increment("hits", 3).await.unwrap(), Some(8));
    assert_eq!(backend.decrement("hits", 10).await.unwrap(), Some(0));
    assert_eq!(backend.get("hits").await.unwrap(), Some("0".to_string()));

    backend.set("title", "abc", None).await.unwrap();
    assert!(matches!(
        backend.increment("title", 1).await,
        Err(CacheError::NonNumeric(key)) if key == "title"
    ));
}

#[tokio::test]
async fn test_conditional_writes_report_conflicts() {
    let node = Node::start();
    let backend = connect(&node).await;

    assert_eq!(
        backend.replace("k", "x", None).await.unwrap(),
        WriteOutcome::NotStored
    );
    assert!(!node.contains("k"));

    assert_eq!(
        backend.add("k", "1", None).await.unwrap(),
        WriteOutcome::Stored
    );
    assert_eq!(
        backend.add("k", "2", None).await.unwrap(),
        WriteOutcome::NotStored
    );
    assert_eq!(backend.get("k").await.unwrap(), Some("1".to_string()));

    assert_eq!(
        backend.replace("k", "3", None).await.unwrap(),
        WriteOutcome::Stored
    );
    assert_eq!(backend.get("k").await.unwrap(), Some("3".to_string()));
}

#[tokio::test]
async fn test_delete_reports_whether_removed() {
    let node = Node::start();
    let backend = connect(&node).await;

    backend.set("k", "v", None).await.unwrap();
    assert!(backend.delete("k").await.unwrap());
    assert!(!backend.delete("k").await.unwrap());
    assert_eq!(backend.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_increment_of_missing_key_leaves_local_cache_empty() {
    let node = Node::start();
    let router = BackendRouter::new(Arc::new(connect(&node).await));
    let context = CacheContext::new(Arc::new(router), &CacheConfig::new("blog")).unwrap();
    let mut cache = context.begin();

    assert_eq!(cache.increment("views", "posts", 1).await.unwrap(), None);
    assert!(cache.local_cache().is_empty());
    assert_eq!(cache.get("views", "posts").await.unwrap(), None);

    cache.set("views", "posts", "41", None).await.unwrap();
    assert_eq!(cache.increment("views", "posts", 1).await.unwrap(), Some(42));
    assert_eq!(cache.get("views", "posts").await.unwrap(), Some("42".to_string()));
}
