//! The eight atomic registry scripts.
//!
//! Each script is a single server-side transaction over the namespaced
//! keys; every multi-key invariant of the data model is maintained inside
//! these scripts and nowhere else. Shared helpers (guarded JSON decode,
//! the salvage sub-routine) are prepended to the bodies that need them.
//!
//! Conventions used throughout:
//! - corrupt records are repaired in place: the entry is deleted and the
//!   matching `gh` counter (`workersBroken` / `brokersBroken`) bumped
//! - the liveness probe is `PUBLISH <chPrefix>:<brokerId> ""`; a zero
//!   subscriber count means the broker is dead
//! - control signals go out on the literal `<chPrefix>:*` channel
//! - replies are tagged arrays; a bare `[0]` stands in for "found
//!   nothing" because a Lua `false` would truncate the reply array

use redis::Script;

/// Helpers shared by several scripts.
const HELPERS: &str = r#"
local function decode(raw)
    local ok, value = pcall(cjson.decode, raw)
    if ok and type(value) == 'table' then
        return value
    end
    return nil
end

local function is_recoverable(rec)
    return type(rec.attributes) == 'table' and rec.attributes.recoverable == true
end

local function salvage_workers(gh, wh, wz, rz, keep)
    while true do
        local entry = redis.call('ZRANGE', wz, 0, 0, 'WITHSCORES')
        if #entry == 0 then
            return
        end
        local wid = entry[1]
        local score = entry[2]
        local raw = redis.call('HGET', wh, wid)
        if raw then
            local rec = decode(raw)
            if rec == nil then
                redis.call('HDEL', wh, wid)
                redis.call('HINCRBY', gh, 'workersBroken', 1)
            elseif keep and is_recoverable(rec) then
                rec.brokerId = nil
                redis.call('HSET', wh, wid, cjson.encode(rec))
                redis.call('ZADD', rz, score, wid)
                redis.call('HINCRBY', gh, 'workersSalvaged', 1)
            else
                redis.call('HDEL', wh, wid)
                redis.call('HINCRBY', gh, 'workersRemoved', 1)
            end
        end
        redis.call('ZREM', wz, wid)
    end
end
"#;

/// `join` — KEYS `[gh, bh, cz, bz, wz, rz, wh]`,
/// ARGV `[brokerId, chPrefix, load, cluster, addr, hashKey]` → `[0]`.
///
/// Registers (or re-registers) a broker. A decodable stale record means a
/// previous incarnation died without salvage: its recoverable workers move
/// to the recovery set with their original creation time, the rest are
/// deleted. The worker set is cleared unconditionally for a fresh start.
const JOIN: &str = r#"
local gh, bh, cz, bz, wz, rz, wh =
    KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7]
local brokerId, chPrefix, load, cluster, addr, hashKey =
    ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6]

redis.call('HSET', gh, 'chPrefix', chPrefix)

local prev = redis.call('HGET', bh, brokerId)
if prev then
    if decode(prev) then
        salvage_workers(gh, wh, wz, rz, true)
    else
        redis.call('HINCRBY', gh, 'brokersBroken', 1)
    end
end

redis.call('DEL', wz)
redis.call('HSET', bh, brokerId,
    cjson.encode({cn = cluster, st = 'active', addr = addr}))
redis.call('ZADD', cz, tonumber(load), brokerId)
redis.call('ZADD', bz, tonumber(hashKey), brokerId)
redis.call('HINCRBY', gh, 'brokersAdded', 1)
return {0}
"#;

/// `pick_broker` — KEYS `[gh, bh, cz]`, ARGV `[cluster, maxRetries]`
/// → `[brokerId, cluster, addr]` or nil.
///
/// Reads the lowest-loaded member, verifies it is active and alive, and
/// returns it. Dead members are invalidated, a salvage broadcast, and the
/// member dropped from the load set before retrying, so selection is
/// biased toward whichever broker survived the last invalidation sweep
/// rather than a strict global minimum (preserved source behaviour).
const PICK_BROKER: &str = r#"
local gh, bh, cz = KEYS[1], KEYS[2], KEYS[3]
local cluster = ARGV[1]
local maxRetries = tonumber(ARGV[2]) or 100
local chPrefix = redis.call('HGET', gh, 'chPrefix')

for _ = 1, maxRetries do
    local top = redis.call('ZRANGE', cz, 0, 0)
    if #top == 0 then
        return false
    end
    local brokerId = top[1]
    local raw = redis.call('HGET', bh, brokerId)
    local rec = nil
    if raw then
        rec = decode(raw)
    end
    if rec == nil then
        if raw then
            redis.call('HDEL', bh, brokerId)
            redis.call('HINCRBY', gh, 'brokersBroken', 1)
        end
        redis.call('ZREM', cz, brokerId)
    elseif rec.st ~= 'active' then
        redis.call('ZREM', cz, brokerId)
    else
        local subs = redis.call('PUBLISH', chPrefix .. ':' .. brokerId, '')
        if subs > 0 then
            return {brokerId, cluster, rec.addr or ''}
        end
        rec.st = 'invalid'
        redis.call('HSET', bh, brokerId, cjson.encode(rec))
        redis.call('PUBLISH', chPrefix .. ':*',
            cjson.encode({sig = 'salvage', clustername = cluster, brokerId = brokerId}))
        redis.call('ZREM', cz, brokerId)
    end
end
return false
"#;

/// `find_or_create` — KEYS `[gh, wh, bh, rz, wz]`,
/// ARGV `[brokerId, name, workerId, attributes, now, ttl, forRecovery]`
/// → `[0, [brokerId, name, id]]` | `[0]` (find miss) | `[1]` (retry).
///
/// An empty `brokerId` means find-only. In create mode an empty
/// `workerId` is derived: the class name for static workers, otherwise
/// `name#<per-class counter>`. A worker whose record has no owner is in
/// its migration window: create mode re-attaches it from the recovery set
/// when it is still within TTL, find-only mode asks the caller to retry.
const FIND_OR_CREATE: &str = r#"
local gh, wh, bh, rz, wz = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5]
local brokerId, name, workerId = ARGV[1], ARGV[2], ARGV[3]
local attributes = ARGV[4]
local now, ttl = tonumber(ARGV[5]), tonumber(ARGV[6])
local forRecovery = ARGV[7]
local chPrefix = redis.call('HGET', gh, 'chPrefix')
local createMode = brokerId ~= ''

local attrs = decode(attributes) or {}

if workerId == '' then
    if not createMode then
        return {0}
    end
    if attrs['static'] == true then
        workerId = name
    else
        local n = redis.call('HINCRBY', gh, name, 1)
        workerId = name .. '#' .. tostring(n)
    end
end

local info = nil
local raw = redis.call('HGET', wh, workerId)
if raw then
    info = decode(raw)
    if info == nil then
        redis.call('HDEL', wh, workerId)
        redis.call('HINCRBY', gh, 'workersBroken', 1)
    end
end

if info and info.brokerId then
    local braw = redis.call('HGET', bh, info.brokerId)
    local brec = nil
    if braw then
        brec = decode(braw)
    end
    if brec then
        local subs = redis.call('PUBLISH', chPrefix .. ':' .. info.brokerId, '')
        if subs > 0 then
            return {0, {info.brokerId, info.name, workerId}}
        end
        brec.st = 'invalid'
        redis.call('HSET', bh, info.brokerId, cjson.encode(brec))
        redis.call('PUBLISH', chPrefix .. ':*',
            cjson.encode({sig = 'salvage', clustername = brec.cn, brokerId = info.brokerId}))
        return {1}
    end
    if braw then
        redis.call('HDEL', bh, info.brokerId)
        redis.call('HINCRBY', gh, 'brokersBroken', 1)
    end
    info = nil
elseif info then
    if not createMode then
        return {1}
    end
    local score = redis.call('ZSCORE', rz, workerId)
    if score then
        if ttl == 0 or now - tonumber(score) <= ttl then
            info.brokerId = brokerId
            redis.call('HSET', wh, workerId, cjson.encode(info))
            redis.call('ZADD', wz, tonumber(score), workerId)
            redis.call('ZREM', rz, workerId)
            redis.call('HINCRBY', gh, 'workersRecovered', 1)
            return {0, {brokerId, info.name, workerId}}
        end
        redis.call('ZREM', rz, workerId)
    end
end

if not createMode then
    return {0}
end

redis.call('HSET', wh, workerId,
    cjson.encode({name = name, brokerId = brokerId, attributes = attrs}))
redis.call('ZADD', wz, now, workerId)
if forRecovery == '1' then
    redis.call('HINCRBY', gh, 'workersRecovered', 1)
else
    redis.call('HINCRBY', gh, 'workersCreated', 1)
end
return {0, {brokerId, name, workerId}}
"#;

/// `find_broker` — KEYS `[gh, wh, bh]`, ARGV `[selfBrokerId, workerId]`
/// → `[0, [brokerId, cn, st, addr]]` | `[1]` | `[2, brokerId]`.
///
/// Locates the owning broker. An unreachable owner is invalidated, the
/// worker's `brokerId` cleared so it reads as under migration, and a
/// salvage broadcast issued; the caller retries on `[2]`. When the owner
/// is the caller itself the probe is skipped.
const FIND_BROKER: &str = r#"
local gh, wh, bh = KEYS[1], KEYS[2], KEYS[3]
local selfBrokerId, workerId = ARGV[1], ARGV[2]
local chPrefix = redis.call('HGET', gh, 'chPrefix')

local raw = redis.call('HGET', wh, workerId)
if not raw then
    return {1}
end
local info = decode(raw)
if info == nil then
    redis.call('HDEL', wh, workerId)
    redis.call('HINCRBY', gh, 'workersBroken', 1)
    return {1}
end
if not info.brokerId then
    return {1}
end

local owner = info.brokerId
local braw = redis.call('HGET', bh, owner)
if not braw then
    return {1}
end
local brec = decode(braw)
if brec == nil then
    redis.call('HDEL', bh, owner)
    redis.call('HINCRBY', gh, 'brokersBroken', 1)
    return {1}
end

if owner == selfBrokerId then
    return {0, {owner, brec.cn or '', brec.st or '', brec.addr or ''}}
end

local subs = redis.call('PUBLISH', chPrefix .. ':' .. owner, '')
if subs > 0 then
    return {0, {owner, brec.cn or '', brec.st or '', brec.addr or ''}}
end

brec.st = 'invalid'
redis.call('HSET', bh, owner, cjson.encode(brec))
info.brokerId = nil
redis.call('HSET', wh, workerId, cjson.encode(info))
redis.call('PUBLISH', chPrefix .. ':*',
    cjson.encode({sig = 'salvage', clustername = brec.cn, brokerId = owner}))
return {2, owner}
"#;

/// `health_check` — KEYS `[gh, bh, cz, bz]`, ARGV `[selfBrokerId]`
/// → `[0]` | `[1]` (salvage issued) | `[2, msg]` (ring pruned).
///
/// Each broker watches its successor on the hash-scored ring. A
/// missing/unusable successor record is pruned from all three structures;
/// a dead active successor is invalidated, dropped from both cluster
/// sets, and a salvage broadcast. A ring of one has nothing to check.
const HEALTH_CHECK: &str = r#"
local gh, bh, cz, bz = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local selfBrokerId = ARGV[1]
local chPrefix = redis.call('HGET', gh, 'chPrefix')

local rank = redis.call('ZRANK', bz, selfBrokerId)
if rank == false then
    return {2, 'broker ' .. selfBrokerId .. ' is not on the ring'}
end
local size = redis.call('ZCARD', bz)
if size <= 1 then
    return {0}
end

local peer = redis.call('ZRANGE', bz, (rank + 1) % size, (rank + 1) % size)[1]
local braw = redis.call('HGET', bh, peer)
if not braw then
    redis.call('ZREM', cz, peer)
    redis.call('ZREM', bz, peer)
    return {2, 'removed broker ' .. peer .. ': record missing'}
end
local brec = decode(braw)
if brec == nil or not brec.addr then
    redis.call('HDEL', bh, peer)
    redis.call('ZREM', cz, peer)
    redis.call('ZREM', bz, peer)
    return {2, 'removed broker ' .. peer .. ': record unusable'}
end
if brec.st ~= 'active' then
    return {0}
end

local subs = redis.call('PUBLISH', chPrefix .. ':' .. peer, '')
if subs > 0 then
    return {0}
end

brec.st = 'invalid'
redis.call('HSET', bh, peer, cjson.encode(brec))
redis.call('ZREM', cz, peer)
redis.call('ZREM', bz, peer)
redis.call('PUBLISH', chPrefix .. ':*',
    cjson.encode({sig = 'salvage', clustername = brec.cn, brokerId = peer}))
return {1}
"#;

/// `salvage` — KEYS `[gh, wh, bh, cz, bz, wz, rz]`,
/// ARGV `[targetBrokerId, mode]` → `[0]`.
///
/// Mode 0 (peer salvage) proceeds only when the target record decodes
/// with `st = invalid`, making racing salvagers idempotent. Mode 1
/// (self-destroy) salvages recoverable workers; mode 2 treats everything
/// as non-recoverable and clears the worker set outright. A `recover`
/// broadcast follows whenever the recovery set is non-empty.
const SALVAGE: &str = r#"
local gh, wh, bh, cz, bz, wz, rz =
    KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7]
local target = ARGV[1]
local mode = tonumber(ARGV[2])
local chPrefix = redis.call('HGET', gh, 'chPrefix')

if mode == 0 then
    local braw = redis.call('HGET', bh, target)
    if not braw then
        return {0}
    end
    local brec = decode(braw)
    if brec == nil or brec.st ~= 'invalid' then
        return {0}
    end
end

salvage_workers(gh, wh, wz, rz, mode ~= 2)

redis.call('HDEL', bh, target)
redis.call('ZREM', cz, target)
redis.call('ZREM', bz, target)
if mode == 2 then
    redis.call('DEL', wz)
end
if redis.call('ZCARD', rz) > 0 then
    redis.call('PUBLISH', chPrefix .. ':*', cjson.encode({sig = 'recover'}))
end
return {0}
"#;

/// `fetch_for_recovery` — KEYS `[gh, wh, rz]`, ARGV `[now, ttl, maxFetch]`
/// → `[[record…], remaining]`.
///
/// Pops up to `maxFetch` entries (oldest first), emitting each decodable,
/// recoverable, in-TTL record as JSON with `id` and `createdAt` filled
/// in. Entries leave the recovery set whether or not they are emitted, so
/// exactly one competing peer wins any given worker; records that cannot
/// be recovered are deleted rather than left orphaned.
const FETCH_FOR_RECOVERY: &str = r#"
local gh, wh, rz = KEYS[1], KEYS[2], KEYS[3]
local now, ttl = tonumber(ARGV[1]), tonumber(ARGV[2])
local maxFetch = tonumber(ARGV[3])

local fetched = {}
for _ = 1, maxFetch do
    local entry = redis.call('ZRANGE', rz, 0, 0, 'WITHSCORES')
    if #entry == 0 then
        break
    end
    local wid = entry[1]
    local score = tonumber(entry[2])
    redis.call('ZREM', rz, wid)
    local raw = redis.call('HGET', wh, wid)
    if raw then
        local rec = decode(raw)
        if rec == nil then
            redis.call('HDEL', wh, wid)
            redis.call('HINCRBY', gh, 'workersBroken', 1)
        elseif is_recoverable(rec) and (ttl == 0 or now - score <= ttl) then
            rec.id = wid
            rec.createdAt = score
            fetched[#fetched + 1] = cjson.encode(rec)
        else
            redis.call('HDEL', wh, wid)
            redis.call('HINCRBY', gh, 'workersRemoved', 1)
        end
    end
end
return {fetched, redis.call('ZCARD', rz)}
"#;

/// `destroy_worker` — KEYS `[gh, wh, rz, wz]`,
/// ARGV `[workerId, mode, now]` → `[0]`.
///
/// Mode 1 with a live recoverable record parks the worker in the
/// recovery set, preserving its creation time; anything else deletes the
/// record. The owner's worker set always loses the entry.
const DESTROY_WORKER: &str = r#"
local gh, wh, rz, wz = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local workerId = ARGV[1]
local mode = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local chPrefix = redis.call('HGET', gh, 'chPrefix')

local raw = redis.call('HGET', wh, workerId)
if raw then
    local rec = decode(raw)
    if rec == nil then
        redis.call('HDEL', wh, workerId)
        redis.call('HINCRBY', gh, 'workersBroken', 1)
    elseif mode == 1 and is_recoverable(rec) then
        local score = redis.call('ZSCORE', wz, workerId)
        rec.brokerId = nil
        redis.call('HSET', wh, workerId, cjson.encode(rec))
        redis.call('ZADD', rz, tonumber(score) or now, workerId)
    else
        redis.call('HDEL', wh, workerId)
        redis.call('HINCRBY', gh, 'workersRemoved', 1)
    end
end

redis.call('ZREM', wz, workerId)
if redis.call('ZCARD', rz) > 0 then
    redis.call('PUBLISH', chPrefix .. ':*', cjson.encode({sig = 'recover'}))
end
return {0}
"#;

/// The prepared script set for one registry.
pub struct RegistryScripts {
    pub join: Script,
    pub pick_broker: Script,
    pub find_or_create: Script,
    pub find_broker: Script,
    pub health_check: Script,
    pub salvage: Script,
    pub fetch_for_recovery: Script,
    pub destroy_worker: Script,
}

impl RegistryScripts {
    /// Builds the script set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            join: Script::new(&with_helpers(JOIN)),
            pick_broker: Script::new(&with_helpers(PICK_BROKER)),
            find_or_create: Script::new(&with_helpers(FIND_OR_CREATE)),
            find_broker: Script::new(&with_helpers(FIND_BROKER)),
            health_check: Script::new(&with_helpers(HEALTH_CHECK)),
            salvage: Script::new(&with_helpers(SALVAGE)),
            fetch_for_recovery: Script::new(&with_helpers(FETCH_FOR_RECOVERY)),
            destroy_worker: Script::new(&with_helpers(DESTROY_WORKER)),
        }
    }

    /// All scripts, for cache priming at broker start.
    #[must_use]
    pub fn all(&self) -> [&Script; 8] {
        [
            &self.join,
            &self.pick_broker,
            &self.find_or_create,
            &self.find_broker,
            &self.health_check,
            &self.salvage,
            &self.fetch_for_recovery,
            &self.destroy_worker,
        ]
    }
}

impl Default for RegistryScripts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistryScripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryScripts").finish_non_exhaustive()
    }
}

fn with_helpers(body: &str) -> String {
    format!("{HELPERS}\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_build_and_hash() {
        let scripts = RegistryScripts::new();
        // Distinct sources must produce distinct content hashes.
        let hashes: std::collections::HashSet<_> =
            scripts.all().iter().map(|s| s.get_hash().to_owned()).collect();
        assert_eq!(hashes.len(), 8);
    }

    #[test]
    fn bodies_include_helpers() {
        for script in [&JOIN, &SALVAGE, &FETCH_FOR_RECOVERY, &FIND_OR_CREATE] {
            let source = with_helpers(script);
            assert!(source.contains("local function decode"));
            assert!(source.contains("local function is_recoverable"));
        }
        // The salvage sub-routine backs join and salvage.
        assert!(with_helpers(JOIN).contains("salvage_workers(gh, wh, wz, rz, true)"));
        assert!(with_helpers(SALVAGE).contains("salvage_workers(gh, wh, wz, rz, mode ~= 2)"));
    }
}
