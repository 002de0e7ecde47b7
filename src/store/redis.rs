//! Redis lock and counter.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::{Commands, Connection, Script};

use super::{owner_token, parse_counter, CounterStore, DistributedLock, StoreResult};

/// Delete the lock only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn connect(url: &str) -> StoreResult<Connection> {
    let client = ::redis::Client::open(url)?;
    Ok(client.get_connection()?)
}

/// Single-instance Redis lock: `SET name token NX [PX lease]`.
pub struct RedisLock {
    con: Connection,
    release: Script,
    owner: String,
    held: HashMap<String, String>,
}

impl RedisLock {
    pub fn connect(url: &str) -> StoreResult<Self> {
        Ok(Self {
            con: connect(url)?,
            release: Script::new(RELEASE_SCRIPT),
            owner: owner_token(),
            held: HashMap::new(),
        })
    }
}

impl DistributedLock for RedisLock {
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(name).arg(&self.owner).arg("NX");
        if !lease.is_zero() {
            cmd.arg("PX").arg(lease.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query(&mut self.con)?;
        if reply.is_some() {
            self.held.insert(name.to_owned(), self.owner.clone());
            return Ok(true);
        }
        Ok(false)
    }

    fn release(&mut self, name: &str) -> StoreResult<bool> {
        let Some(token) = self.held.remove(name) else {
            return Ok(false);
        };
        let deleted: i64 = self
            .release
            .key(name)
            .arg(token)
            .invoke(&mut self.con)?;
        Ok(deleted == 1)
    }
}

/// Counter stored as a plain Redis string.
pub struct RedisCounter {
    con: Connection,
}

impl RedisCounter {
    pub fn connect(url: &str) -> StoreResult<Self> {
        Ok(Self { con: connect(url)? })
    }
}

impl CounterStore for RedisCounter {
    fn fetch(&mut self, key: &str) -> StoreResult<Option<u64>> {
        let raw: Option<String> = self.con.get(key)?;
        raw.map(|raw| parse_counter(key, &raw)).transpose()
    }

    fn put(&mut self, key: &str, value: u64) -> StoreResult<()> {
        self.con.set::<_, _, ()>(key, value)?;
        Ok(())
    }

    fn forget(&mut self, key: &str) -> StoreResult<()> {
        self.con.del::<_, ()>(key)?;
        Ok(())
    }
}
