use anyhow::Result;
use deadpool_redis::Connection;
use redis::cmd;

pub async fn set_all_with_ttl(
    mut connection: Connection,
    entries: Vec<(String, String)>,
    ttl_secs: u64,
) -> Result<()> {
    for (key, value) in entries {
        #[rustfmt::skip]
        cmd("SETEX")
            .arg(&key)      // key
            .arg(ttl_secs)  // expiry in seconds
            .arg(&value)    // value
            .query_async::<()>(&mut connection)
            .await?;
    }
    Ok(())
}

pub async fn get(mut connection: Connection, key: &str) -> Result<Option<String>> {
    Ok(cmd("GET")
        .arg(key)
        .query_async::<Option<String>>(&mut connection)
        .await?)
}

pub async fn del(mut connection: Connection, keys: Vec<String>) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    cmd("DEL")
        .arg(&keys)
        .query_async::<()>(&mut connection)
        .await?;
    Ok(())
}

/// Takes the lock key for `ttl_secs` unless another holder has it. The TTL
/// bounds how long a crashed holder can wedge the key.
pub async fn try_acquire_lock(
    mut connection: Connection,
    key: &str,
    ttl_secs: u64,
) -> Result<bool> {
    #[rustfmt::skip]
    let outcome = cmd("SET")
        .arg(key)       // lock key
        .arg("1")       // holder marker
        .arg("NX")      // NX: only set if not already held
        .arg("EX")      // with expiry
        .arg(ttl_secs)
        .query_async::<Option<String>>(&mut connection)
        .await?;
    Ok(outcome.is_some())
}

pub async fn release_lock(mut connection: Connection, key: &str) -> Result<()> {
    cmd("DEL")
        .arg(key)
        .query_async::<()>(&mut connection)
        .await?;
    Ok(())
}
