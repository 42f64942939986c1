//! Lua scripts executed server-side for atomicity.

/// Token-bucket refill-and-decrement.
///
/// KEYS[1]: bucket hash key. ARGV[1]: refill rate (tokens/sec).
/// ARGV[2]: capacity. Uses the Redis `TIME` command so every instance
/// shares the store's clock. Returns `{allowed, retry_after_ms}`.
///
/// The bucket hash holds `tokens` (fractional) and `ts` (last refill,
/// epoch milliseconds). A TTL of twice the full-refill time (min 60 s)
/// reaps idle buckets.
pub const TOKEN_BUCKET: &str = r"
local key = KEYS[1]
local rps = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])

local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local bucket = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(bucket[1])
local ts = tonumber(bucket[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now_ms
end

local elapsed_ms = now_ms - ts
if elapsed_ms < 0 then
  elapsed_ms = 0
end
tokens = math.min(burst, tokens + elapsed_ms * rps / 1000)

local allowed = 0
local retry_ms = 0
if tokens >= 1 then
  allowed = 1
  tokens = tokens - 1
else
  retry_ms = math.ceil((1 - tokens) * 1000 / rps)
end

redis.call('HSET', key, 'tokens', tokens, 'ts', now_ms)
local ttl_ms = math.max(60000, math.ceil(burst * 2000 / rps))
redis.call('PEXPIRE', key, ttl_ms)

return {allowed, retry_ms}
";
