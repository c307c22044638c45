use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{
    AccountIdentity, AccountStore, CreditRequest, CreditRequestStatus, CreditReview, StoreError,
    UserCreditAccount,
};
use crate::ledger::{TOP_UP_WINDOW_MS, TopUpOutcome, TopUpPolicy};

// Prepended to every account script so the lazy-create step runs inside the
// same atomic script as the mutation.
const ENSURE_ACCOUNT_LUA: &str = r#"
local function ensure_account(account_key, accounts_key, user_id, now_ms)
  if redis.call("EXISTS", account_key) == 0 then
    redis.call("HSET", account_key,
      "credits", 0,
      "total_generations", 0,
      "created_at_ms", now_ms,
      "updated_at_ms", now_ms)
  end
  redis.call("SADD", accounts_key, user_id)
end
"#;

const RESERVE_ONE_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]

ensure_account(account_key, accounts_key, user_id, now_ms)

local credits = tonumber(redis.call("HGET", account_key, "credits") or "0") or 0
if credits <= 0 then
  return -1
end

local remaining = redis.call("HINCRBY", account_key, "credits", -1)
redis.call("HINCRBY", account_key, "total_generations", 1)
redis.call("HSET", account_key, "updated_at_ms", now_ms)
return remaining
"#;

const REFUND_ONE_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]

ensure_account(account_key, accounts_key, user_id, now_ms)

redis.call("HINCRBY", account_key, "credits", 1)
local total = redis.call("HINCRBY", account_key, "total_generations", -1)
if total < 0 then
  redis.call("HSET", account_key, "total_generations", 0)
end
redis.call("HSET", account_key, "updated_at_ms", now_ms)
return 1
"#;

const TOP_UP_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0
local increment = tonumber(ARGV[3]) or 0
local cap = tonumber(ARGV[4]) or 0
local window_ms = tonumber(ARGV[5]) or 0

ensure_account(account_key, accounts_key, user_id, ARGV[2])

local last = redis.call("HGET", account_key, "last_credit_refresh_ms")
if last then
  local elapsed = now_ms - (tonumber(last) or 0)
  if elapsed < window_ms then
    return { "SKIP" }
  end
end

local credits = tonumber(redis.call("HGET", account_key, "credits") or "0") or 0
local awarded = 0
local capped = 0
if credits >= cap then
  capped = 1
else
  awarded = math.min(increment, cap - credits)
  if awarded < increment then
    capped = 1
  end
end

local new_balance = credits + awarded
redis.call("HSET", account_key,
  "credits", new_balance,
  "last_credit_refresh_ms", ARGV[2],
  "updated_at_ms", ARGV[2])
return { "OK", tostring(awarded), tostring(new_balance), tostring(capped) }
"#;

const SET_CREDITS_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]

ensure_account(account_key, accounts_key, user_id, now_ms)
redis.call("HSET", account_key, "credits", ARGV[3], "updated_at_ms", now_ms)
return 1
"#;

const ADD_CREDITS_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]
local delta = tonumber(ARGV[3]) or 0

ensure_account(account_key, accounts_key, user_id, now_ms)
local credits = redis.call("HINCRBY", account_key, "credits", delta)
if credits < 0 then
  redis.call("HSET", account_key, "credits", 0)
  credits = 0
end
redis.call("HSET", account_key, "updated_at_ms", now_ms)
return credits
"#;

const RECORD_IDENTITY_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]
local email = ARGV[3]
local display_name = ARGV[4]

ensure_account(account_key, accounts_key, user_id, now_ms)

local changed = 0
if email ~= "" and redis.call("HEXISTS", account_key, "email") == 0 then
  redis.call("HSET", account_key, "email", email)
  changed = 1
end
if display_name ~= "" and redis.call("HEXISTS", account_key, "display_name") == 0 then
  redis.call("HSET", account_key, "display_name", display_name)
  changed = 1
end
if changed == 1 then
  redis.call("HSET", account_key, "updated_at_ms", now_ms)
end
return changed
"#;

const LOAD_ACCOUNT_LUA: &str = r#"
local account_key = KEYS[1]
local accounts_key = KEYS[2]
local user_id = ARGV[1]
local now_ms = ARGV[2]

ensure_account(account_key, accounts_key, user_id, now_ms)
return redis.call("HGETALL", account_key)
"#;

const REVIEW_CREDIT_REQUEST_LUA: &str = r#"
local request_key = KEYS[1]
local accounts_key = KEYS[2]
local account_key = KEYS[3]

local user_id = ARGV[1]
local status = ARGV[2]
local now_ms = ARGV[3]
local credits = tonumber(ARGV[4]) or 0

if redis.call("EXISTS", request_key) == 0 then
  return { "MISS" }
end
if redis.call("HGET", request_key, "user_id") ~= user_id then
  return { "OWNER" }
end

local current = redis.call("HGET", request_key, "status")
if current ~= "pending" then
  return { "DONE", current or "" }
end

redis.call("HSET", request_key,
  "status", status,
  "reviewed_at_ms", now_ms,
  "credits_granted", credits)

if credits > 0 then
  ensure_account(account_key, accounts_key, user_id, now_ms)
  redis.call("HINCRBY", account_key, "credits", credits)
  redis.call("HSET", account_key, "updated_at_ms", now_ms)
end

return { "OK" }
"#;

/// Redis-backed store for deployments with several server instances. Every
/// account mutation is a single Lua script, which Redis runs atomically.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto_credits".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_accounts(&self) -> String {
        format!("{}:accounts", self.prefix)
    }

    fn key_account(&self, user_id: &str) -> String {
        format!("{}:account:{user_id}", self.prefix)
    }

    fn key_credit_request_seq(&self) -> String {
        format!("{}:credit_request_seq", self.prefix)
    }

    fn key_credit_requests(&self) -> String {
        format!("{}:credit_requests", self.prefix)
    }

    fn key_credit_request(&self, id: i64) -> String {
        format!("{}:credit_request:{id}", self.prefix)
    }
}

fn account_script(body: &str) -> redis::Script {
    redis::Script::new(&format!("{ENSURE_ACCOUNT_LUA}{body}"))
}

#[async_trait]
impl AccountStore for RedisStore {
    async fn account(&self, user_id: &str, now_ms: u64) -> Result<UserCreditAccount, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = account_script(LOAD_ACCOUNT_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(account_from_fields(user_id, &fields))
    }

    async fn reserve_one(&self, user_id: &str, now_ms: u64) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let remaining: i64 = account_script(RESERVE_ONE_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(u64::try_from(remaining).ok())
    }

    async fn refund_one(&self, user_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = account_script(REFUND_ONE_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn top_up(
        &self,
        user_id: &str,
        now_ms: u64,
        policy: TopUpPolicy,
    ) -> Result<Option<TopUpOutcome>, StoreError> {
        let mut conn = self.connection().await?;
        let result: Vec<String> = account_script(TOP_UP_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .arg(policy.increment)
            .arg(policy.cap)
            .arg(TOP_UP_WINDOW_MS)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("SKIP") => Ok(None),
            Some("OK") => {
                let field = |idx: usize| {
                    result
                        .get(idx)
                        .and_then(|raw| raw.parse::<u64>().ok())
                        .unwrap_or(0)
                };
                Ok(Some(TopUpOutcome {
                    awarded: field(1),
                    new_balance: field(2),
                    capped: field(3) == 1,
                }))
            }
            _ => Err(unexpected_response()),
        }
    }

    async fn set_credits(
        &self,
        user_id: &str,
        credits: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = account_script(SET_CREDITS_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .arg(credits)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_credits(
        &self,
        user_id: &str,
        delta: i64,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let credits: i64 = account_script(ADD_CREDITS_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(u64::try_from(credits).unwrap_or(0))
    }

    async fn record_identity(
        &self,
        user_id: &str,
        identity: &AccountIdentity,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = account_script(RECORD_IDENTITY_LUA)
            .key(self.key_account(user_id))
            .key(self.key_accounts())
            .arg(user_id)
            .arg(now_ms)
            .arg(identity.email().unwrap_or_default())
            .arg(identity.display_name().unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_account(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.key_account(user_id))
            .srem(self.key_accounts(), user_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, StoreError> {
        let mut conn = self.connection().await?;
        let mut user_ids: Vec<String> = conn.smembers(self.key_accounts()).await?;
        user_ids.sort();

        let mut out = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let fields: HashMap<String, String> = conn.hgetall(self.key_account(&user_id)).await?;
            if fields.is_empty() {
                continue;
            }
            out.push(account_from_fields(&user_id, &fields));
        }
        Ok(out)
    }

    async fn create_credit_request(
        &self,
        user_id: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError> {
        let mut conn = self.connection().await?;
        let id: i64 = conn.incr(self.key_credit_request_seq(), 1).await?;
        let request = CreditRequest {
            id,
            user_id: user_id.to_string(),
            message: message.to_string(),
            status: CreditRequestStatus::Pending,
            created_at_ms: now_ms,
            reviewed_at_ms: None,
            credits_granted: 0,
        };

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.key_credit_request(id),
                &[
                    ("id", id.to_string()),
                    ("user_id", request.user_id.clone()),
                    ("message", request.message.clone()),
                    ("status", request.status.as_str().to_string()),
                    ("created_at_ms", now_ms.to_string()),
                    ("credits_granted", "0".to_string()),
                ],
            )
            .ignore()
            .zadd(self.key_credit_requests(), id, id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(request)
    }

    async fn list_credit_requests(
        &self,
        status: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<i64> = conn.zrevrange(self.key_credit_requests(), 0, -1).await?;

        let mut out = Vec::new();
        for id in ids {
            let fields: HashMap<String, String> =
                conn.hgetall(self.key_credit_request(id)).await?;
            let Some(request) = credit_request_from_fields(id, &fields) else {
                continue;
            };
            if status.is_none_or(|status| request.status == status) {
                out.push(request);
            }
        }
        Ok(out)
    }

    async fn review_credit_request(
        &self,
        id: i64,
        review: CreditReview,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError> {
        if review.status == CreditRequestStatus::Pending {
            return Err(StoreError::PendingReview);
        }

        let mut conn = self.connection().await?;
        let request_key = self.key_credit_request(id);
        // The owner never changes after creation, so the account key can be
        // resolved up front and declared to the script.
        let user_id: Option<String> = conn.hget(&request_key, "user_id").await?;
        let Some(user_id) = user_id else {
            return Err(StoreError::CreditRequestNotFound { id });
        };
        let result: Vec<String> = account_script(REVIEW_CREDIT_REQUEST_LUA)
            .key(&request_key)
            .key(self.key_accounts())
            .key(self.key_account(&user_id))
            .arg(&user_id)
            .arg(review.status.as_str())
            .arg(now_ms)
            .arg(review.granted_credits())
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("OK") => {}
            Some("MISS") => return Err(StoreError::CreditRequestNotFound { id }),
            Some("DONE") => {
                let status = result
                    .get(1)
                    .and_then(|raw| raw.parse::<CreditRequestStatus>().ok())
                    .unwrap_or(CreditRequestStatus::Approved);
                return Err(StoreError::AlreadyReviewed { id, status });
            }
            _ => return Err(unexpected_response()),
        }

        let fields: HashMap<String, String> = conn.hgetall(&request_key).await?;
        credit_request_from_fields(id, &fields).ok_or(StoreError::CreditRequestNotFound { id })
    }
}

fn unexpected_response() -> StoreError {
    redis::RedisError::from((
        redis::ErrorKind::ResponseError,
        "unexpected redis script response",
    ))
    .into()
}

fn parse_u64(fields: &HashMap<String, String>, name: &str) -> Option<u64> {
    fields.get(name).and_then(|raw| raw.parse::<u64>().ok())
}

fn account_from_fields(user_id: &str, fields: &HashMap<String, String>) -> UserCreditAccount {
    UserCreditAccount {
        user_id: user_id.to_string(),
        credits: parse_u64(fields, "credits").unwrap_or(0),
        total_generations: parse_u64(fields, "total_generations").unwrap_or(0),
        last_credit_refresh_ms: parse_u64(fields, "last_credit_refresh_ms"),
        email: fields.get("email").cloned(),
        display_name: fields.get("display_name").cloned(),
        created_at_ms: parse_u64(fields, "created_at_ms").unwrap_or(0),
        updated_at_ms: parse_u64(fields, "updated_at_ms").unwrap_or(0),
    }
}

fn credit_request_from_fields(id: i64, fields: &HashMap<String, String>) -> Option<CreditRequest> {
    Some(CreditRequest {
        id,
        user_id: fields.get("user_id")?.clone(),
        message: fields.get("message").cloned().unwrap_or_default(),
        status: fields.get("status")?.parse().ok()?,
        created_at_ms: parse_u64(fields, "created_at_ms").unwrap_or(0),
        reviewed_at_ms: parse_u64(fields, "reviewed_at_ms"),
        credits_granted: parse_u64(fields, "credits_granted").unwrap_or(0),
    })
}
