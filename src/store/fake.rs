//! In-process Redis and memcached stand-ins for the backend tests. Each speaks
//! just enough of its wire protocol for the commands the backends send.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

const NIL: &[u8] = b"$-1\r\n";

/// How the server answers lock requests (`SET .. NX`, `add`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Turned down as if somebody else held the key.
    Refuse,
    /// Answered with a server error.
    Fail,
}

#[derive(Debug, Default)]
struct State {
    data: HashMap<Vec<u8>, Vec<u8>>,
    commands: Vec<Vec<String>>,
}

type Shared = Arc<Mutex<State>>;

pub struct FakeServer {
    port: u16,
    state: Shared,
}

impl FakeServer {
    pub fn redis(mode: Mode) -> Self {
        Self::start(mode, serve_resp)
    }

    pub fn memcached(mode: Mode) -> Self {
        Self::start(mode, serve_ascii)
    }

    fn start(mode: Mode, serve: fn(TcpStream, Mode, &Shared) -> io::Result<()>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Shared::default();
        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = shared.clone();
                thread::spawn(move || serve(stream, mode, &shared));
            }
        });
        Self { port, state }
    }

    pub fn redis_url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    pub fn memcached_url(&self) -> String {
        format!("memcache://127.0.0.1:{}?protocol=ascii", self.port)
    }

    /// How many commands named `name` arrived, across all connections.
    pub fn count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .commands
            .iter()
            .filter(|c| c[0].eq_ignore_ascii_case(name))
            .count()
    }

    /// Arguments of the most recent `name` command.
    pub fn last(&self, name: &str) -> Option<Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .commands
            .iter()
            .rev()
            .find(|c| c[0].eq_ignore_ascii_case(name))
            .cloned()
    }
}

fn invalid(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_owned()))
}

fn read_block(reader: &mut impl Read, len: &str) -> io::Result<Vec<u8>> {
    let len: usize = len.parse().map_err(invalid)?;
    let mut buf = vec![0; len + 2];
    reader.read_exact(&mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

fn read_resp(reader: &mut impl BufRead) -> io::Result<Option<Vec<Vec<u8>>>> {
    let Some(header) = read_line(reader)? else {
        return Ok(None);
    };
    let n: usize = header.trim_start_matches('*').parse().map_err(invalid)?;
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        let len = read_line(reader)?.ok_or_else(|| invalid("truncated command"))?;
        args.push(read_block(reader, len.trim_start_matches('$'))?);
    }
    Ok(Some(args))
}

fn bulk(value: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", value.len()).into_bytes();
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
    out
}

fn serve_resp(stream: TcpStream, mode: Mode, state: &Shared) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while let Some(args) = read_resp(&mut reader)? {
        if args.is_empty() {
            return Err(invalid("empty command"));
        }
        let reply = resp_reply(&args, mode, &mut state.lock().unwrap());
        writer.write_all(&reply)?;
    }
    Ok(())
}

fn resp_reply(args: &[Vec<u8>], mode: Mode, state: &mut State) -> Vec<u8> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    state.commands.push(
        args.iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect(),
    );
    match (name.as_str(), args) {
        ("SET", [_, key, value, opts @ ..]) => {
            let nx = opts.iter().any(|o| o.eq_ignore_ascii_case(b"NX"));
            if nx {
                match mode {
                    Mode::Fail => return b"-ERR out of memory\r\n".to_vec(),
                    Mode::Refuse => return NIL.to_vec(),
                    Mode::Normal if state.data.contains_key(key) => return NIL.to_vec(),
                    Mode::Normal => {}
                }
            }
            state.data.insert(key.clone(), value.clone());
            b"+OK\r\n".to_vec()
        }
        ("GET", [_, key]) => match state.data.get(key) {
            Some(value) => bulk(value),
            None => NIL.to_vec(),
        },
        ("DEL", [_, keys @ ..]) => {
            let n = keys
                .iter()
                .filter(|k| state.data.remove(*k).is_some())
                .count();
            format!(":{n}\r\n").into_bytes()
        }
        // Every script the backends run is compare-and-delete.
        ("EVALSHA", [_, _sha, _numkeys, key, token]) => {
            let owned = state.data.get(key) == Some(token);
            if owned {
                state.data.remove(key);
            }
            format!(":{}\r\n", u8::from(owned)).into_bytes()
        }
        ("CLIENT", _) => b"+OK\r\n".to_vec(),
        _ => format!("-ERR unknown command '{name}'\r\n").into_bytes(),
    }
}

fn serve_ascii(stream: TcpStream, mode: Mode, state: &Shared) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while let Some(line) = read_line(&mut reader)? {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let mut state = state.lock().unwrap();
        state
            .commands
            .push(words.iter().map(|w| w.to_string()).collect());
        let reply: Vec<u8> = match words.as_slice() {
            ["version"] => b"VERSION 1.6.21\r\n".to_vec(),
            [cmd @ ("set" | "add"), key, _flags, _exptime, len] => {
                let value = read_block(&mut reader, len)?;
                let add = *cmd == "add";
                match mode {
                    Mode::Fail if add => b"SERVER_ERROR out of memory\r\n".to_vec(),
                    Mode::Refuse if add => b"NOT_STORED\r\n".to_vec(),
                    _ if add && state.data.contains_key(key.as_bytes()) => {
                        b"NOT_STORED\r\n".to_vec()
                    }
                    _ => {
                        state.data.insert(key.as_bytes().to_vec(), value);
                        b"STORED\r\n".to_vec()
                    }
                }
            }
            ["get", key] => match state.data.get(key.as_bytes()) {
                Some(value) => {
                    let mut out = format!("VALUE {key} 0 {}\r\n", value.len()).into_bytes();
                    out.extend_from_slice(value);
                    out.extend_from_slice(b"\r\nEND\r\n");
                    out
                }
                None => b"END\r\n".to_vec(),
            },
            ["delete", key] => match state.data.remove(key.as_bytes()) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            _ => b"ERROR\r\n".to_vec(),
        };
        drop(state);
        writer.write_all(&reply)?;
    }
    Ok(())
}
