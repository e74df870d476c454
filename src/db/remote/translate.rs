//! Relational-text-to-REST translation.
//!
//! The remote store only offers per-table filter/sort/paginate resources,
//! but call sites hold query text written against the embedded schema. This
//! module is a dispatcher over the finite set of shapes that text actually
//! takes, not a general SQL engine: normalized text is classified into a
//! tagged plan, natively supported predicates become REST filters, and
//! everything else (JSON inspection, derived-count thresholds, joins,
//! grouping) is emulated in memory after the fetch.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::ResultRow;
use crate::db::Translation;
use crate::db::libsql::TS_FORMAT;
use crate::error::DatabaseError;

use super::client::{RestClient, TableQuery};
use super::normalize::{
    display_name_of, normalize_message_row, normalize_plain_row, normalize_timestamp, value_as_i64,
};
use super::{CHANNELS_TABLE, MEMBERS_TABLE, MESSAGES_TABLE};

/// Member rows fetched per enrichment round trip.
const MEMBER_BATCH: usize = 100;

/// Window applied to the channel rollup when the text names none.
const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Rollup activity threshold when the HAVING clause names none.
const DEFAULT_MIN_MESSAGES: i64 = 25;

const VIDEO_EXTENSIONS: [&str; 3] = [".mp4", ".mov", ".webm"];

static CHANNEL_IN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"channel_id\s+in\s*\(([^)]+)\)").expect("valid channel IN pattern"));
static CATEGORY_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"category_id\s+in\s*\(([^)]+)\)").expect("valid category IN pattern")
});
static CHANNEL_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"channel_id\s*=\s*(\d+)").expect("valid channel eq pattern"));
static MESSAGE_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"message_id\s*=\s*(\d+)").expect("valid message eq pattern"));
static MEMBER_IN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"member_id\s+in\s*\(([^)]+)\)").expect("valid member IN pattern"));
static MEMBER_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"member_id\s*=\s*(\d+)").expect("valid member eq pattern"));
static CREATED_GTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"created_at\s*>=\s*['"]([^'"]+)['"]"#).expect("valid created_at pattern")
});
static REACTOR_MIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:unique_reactor_count|reaction_count)\s*>=\s*(\d+)")
        .expect("valid reactor threshold pattern")
});
static HAVING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"having\s+count\([^)]*\)\s*>=\s*(\d+)").expect("valid having pattern")
});
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"limit\s+(\d+)").expect("valid limit pattern"));
static WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"datetime\('now',\s*'-(\d+)\s*hours?'\)").expect("valid window pattern")
});
static SETUP_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"setup_complete\s*=\s*(\d+)").expect("valid setup eq pattern"));
static NAME_LIKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"channel_name\)?\s+(not\s+)?like\s+'([^']+)'").expect("valid name like pattern")
});
static CONSENT_EQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sharing_consent\s*=\s*(\d+|true|false)").expect("valid consent eq pattern")
});

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Ordering the text asked for, applied after all emulation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderSpec {
    ReactorsDesc,
    CreatedDesc,
    CreatedAsc,
    Unordered,
}

#[derive(Debug, PartialEq)]
pub(crate) struct MessageQueryPlan {
    pub channel_ids: Vec<i64>,
    /// Category identities from a "channel belongs to category" existence
    /// check; expanded to channel identities before the primary fetch.
    pub category_ids: Vec<i64>,
    pub message_ids: Vec<i64>,
    pub created_after: Option<String>,
    pub min_reactors: Option<i64>,
    pub require_attachments: bool,
    pub require_video: bool,
    pub exclude_nsfw: bool,
    pub want_author_name: bool,
    pub want_channel_name: bool,
    pub group_by_channel: bool,
    pub order: OrderSpec,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ChannelRollupPlan {
    pub channel_ids: Vec<i64>,
    pub category_ids: Vec<i64>,
    pub window_hours: i64,
    pub min_messages: i64,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ChannelScanPlan {
    pub channel_ids: Vec<i64>,
    pub setup_complete: Option<bool>,
    pub name_like: Option<(bool, String)>,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct MemberQueryPlan {
    pub member_ids: Vec<i64>,
    pub sharing_consent: Option<bool>,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum QueryPlan {
    ChannelRollup(ChannelRollupPlan),
    ChannelScan(ChannelScanPlan),
    Messages(MessageQueryPlan),
    Members(MemberQueryPlan),
}

impl QueryPlan {
    fn shape(&self) -> &'static str {
        match self {
            QueryPlan::ChannelRollup(_) => "channel_rollup",
            QueryPlan::ChannelScan(_) => "channel_scan",
            QueryPlan::Messages(_) => "messages",
            QueryPlan::Members(_) => "members",
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

pub(crate) fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ClassifiedParams {
    pub timestamps: Vec<String>,
    pub channel_ids: Vec<i64>,
    pub message_ids: Vec<i64>,
}

/// Sort bound parameters into the roles the shapes use them for. Strings
/// that look like timestamps become range bounds; long digit runs are
/// identity values, to the message or channel column depending on the text.
pub(crate) fn classify_params(normalized: &str, params: &[Value]) -> ClassifiedParams {
    let mut classified = ClassifiedParams::default();
    let message_context = normalized.contains("where message_id");
    for param in params {
        if let Some(text) = param.as_str()
            && (text.contains('T') || text.matches('-').count() >= 2)
        {
            classified.timestamps.push(text.to_string());
            continue;
        }
        let rendered = match param {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let digits = rendered.chars().filter(char::is_ascii_digit).count();
        if digits >= 15
            && let Ok(id) = rendered.trim().parse::<i64>()
        {
            if message_context {
                classified.message_ids.push(id);
            } else {
                classified.channel_ids.push(id);
            }
        }
    }
    classified
}

fn parse_id_list(group: &str) -> Vec<i64> {
    group
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

fn captured_ids(re: &Regex, normalized: &str) -> Vec<i64> {
    re.captures(normalized)
        .map(|caps| parse_id_list(&caps[1]))
        .unwrap_or_default()
}

fn captured_number<T: std::str::FromStr>(re: &Regex, normalized: &str) -> Option<T> {
    re.captures(normalized).and_then(|caps| caps[1].parse().ok())
}

/// Explicit output columns, when the select list is plain enough to honor.
/// Wildcards, expressions and CTE-wrapped text keep the full row.
fn parse_projection(normalized: &str) -> Option<Vec<String>> {
    if normalized.starts_with("with ") {
        return None;
    }
    let rest = normalized.strip_prefix("select ")?;
    let list = &rest[..rest.find(" from ")?];
    let list = list.strip_prefix("distinct ").unwrap_or(list);
    if list.contains('*') || list.contains('(') {
        return None;
    }
    Some(
        list.split(',')
            .map(|column| {
                let column = column.trim();
                let column = column.rsplit(" as ").next().unwrap_or(column);
                let column = column.rsplit('.').next().unwrap_or(column);
                column.trim().to_string()
            })
            .collect(),
    )
}

pub(crate) fn plan_query(normalized: &str, params: &ClassifiedParams) -> Option<QueryPlan> {
    // Only read statements have REST equivalents here. Writes go through
    // the typed operations, never through translation.
    if !normalized.starts_with("select ") && !normalized.starts_with("with ") {
        return None;
    }
    if normalized.starts_with("with ") {
        // Every CTE in the call set wraps a message-shaped query, so the
        // whole text goes down the message path; the extraction patterns
        // reach inside the CTE body.
        return Some(QueryPlan::Messages(plan_messages(normalized, params)));
    }
    if normalized.contains("from channels") {
        if normalized.contains("join messages") || normalized.contains("from messages") {
            return Some(QueryPlan::ChannelRollup(plan_rollup(normalized)));
        }
        return Some(QueryPlan::ChannelScan(plan_channel_scan(
            normalized, params,
        )));
    }
    if normalized.contains("from messages") {
        return Some(QueryPlan::Messages(plan_messages(normalized, params)));
    }
    if normalized.contains("from members") {
        return Some(QueryPlan::Members(plan_members(normalized, params)));
    }
    None
}

fn plan_messages(normalized: &str, params: &ClassifiedParams) -> MessageQueryPlan {
    let mut channel_ids = captured_ids(&CHANNEL_IN_RE, normalized);
    if channel_ids.is_empty()
        && let Some(id) = captured_number::<i64>(&CHANNEL_EQ_RE, normalized)
    {
        channel_ids.push(id);
    }
    if channel_ids.is_empty() {
        channel_ids = params.channel_ids.clone();
    }

    let mut message_ids = Vec::new();
    if let Some(id) = captured_number::<i64>(&MESSAGE_EQ_RE, normalized) {
        message_ids.push(id);
    }
    if message_ids.is_empty() {
        message_ids = params.message_ids.clone();
    }

    let category_ids = if normalized.contains("exists") {
        captured_ids(&CATEGORY_IN_RE, normalized)
    } else {
        Vec::new()
    };

    let created_after = CREATED_GTE_RE
        .captures(normalized)
        .map(|caps| caps[1].to_string())
        .or_else(|| params.timestamps.first().cloned());

    let require_attachments = (normalized.contains("json_valid")
        && normalized.contains("attachments"))
        || normalized.contains("attachments != '[]'")
        || normalized.contains("attachments is not null");

    let order = if normalized.contains("order by") {
        if normalized.contains("unique_reactor_count desc")
            || normalized.contains("reaction_count desc")
        {
            OrderSpec::ReactorsDesc
        } else if normalized.contains("created_at desc") {
            OrderSpec::CreatedDesc
        } else {
            OrderSpec::CreatedAsc
        }
    } else {
        OrderSpec::Unordered
    };

    MessageQueryPlan {
        channel_ids,
        category_ids,
        message_ids,
        created_after,
        min_reactors: captured_number(&REACTOR_MIN_RE, normalized),
        require_attachments,
        require_video: VIDEO_EXTENSIONS
            .iter()
            .any(|ext| normalized.contains(ext))
            || normalized.contains("video"),
        exclude_nsfw: normalized.contains("not like") && normalized.contains("nsfw"),
        want_author_name: normalized.contains("author_name") || normalized.contains("member"),
        want_channel_name: normalized.contains("join channels")
            || normalized.contains("c.channel_name"),
        group_by_channel: normalized.contains("group by channel_id"),
        order,
        limit: captured_number(&LIMIT_RE, normalized),
        projection: parse_projection(normalized),
    }
}

fn plan_rollup(normalized: &str) -> ChannelRollupPlan {
    ChannelRollupPlan {
        channel_ids: captured_ids(&CHANNEL_IN_RE, normalized),
        category_ids: captured_ids(&CATEGORY_IN_RE, normalized),
        window_hours: captured_number(&WINDOW_RE, normalized).unwrap_or(DEFAULT_WINDOW_HOURS),
        min_messages: captured_number(&HAVING_RE, normalized).unwrap_or(DEFAULT_MIN_MESSAGES),
    }
}

fn plan_channel_scan(normalized: &str, params: &ClassifiedParams) -> ChannelScanPlan {
    let mut channel_ids = captured_ids(&CHANNEL_IN_RE, normalized);
    if channel_ids.is_empty()
        && let Some(id) = captured_number::<i64>(&CHANNEL_EQ_RE, normalized)
    {
        channel_ids.push(id);
    }
    if channel_ids.is_empty() {
        channel_ids = params.channel_ids.clone();
    }

    let name_like = NAME_LIKE_RE.captures(normalized).map(|caps| {
        let negated = caps.get(1).is_some();
        (negated, caps[2].to_string())
    });

    ChannelScanPlan {
        channel_ids,
        setup_complete: captured_number::<i64>(&SETUP_EQ_RE, normalized).map(|flag| flag != 0),
        name_like,
        limit: captured_number(&LIMIT_RE, normalized),
        projection: parse_projection(normalized),
    }
}

fn plan_members(normalized: &str, params: &ClassifiedParams) -> MemberQueryPlan {
    let mut member_ids = captured_ids(&MEMBER_IN_RE, normalized);
    if member_ids.is_empty()
        && let Some(id) = captured_number::<i64>(&MEMBER_EQ_RE, normalized)
    {
        member_ids.push(id);
    }
    if member_ids.is_empty() {
        // Identity params in a member query are member identities.
        member_ids = params.channel_ids.clone();
    }

    let sharing_consent = CONSENT_EQ_RE
        .captures(normalized)
        .map(|caps| matches!(&caps[1], "1" | "true"));

    MemberQueryPlan {
        member_ids,
        sharing_consent,
        limit: captured_number(&LIMIT_RE, normalized),
        projection: parse_projection(normalized),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Translate and run one query. `NotTranslatable` is the router's fallback
/// signal; a recognized shape with no matches returns empty rows instead.
pub(crate) async fn execute(
    client: &RestClient,
    page_size: usize,
    sql: &str,
    params: &[Value],
) -> Result<Translation, DatabaseError> {
    let normalized = normalize_sql(sql);
    let classified = classify_params(&normalized, params);
    let Some(plan) = plan_query(&normalized, &classified) else {
        warn!("query text matches no supported shape");
        return Ok(Translation::NotTranslatable("unrecognized query shape"));
    };
    debug!(shape = plan.shape(), "translated query");

    let rows = match plan {
        QueryPlan::ChannelRollup(plan) => run_channel_rollup(client, page_size, plan).await?,
        QueryPlan::ChannelScan(plan) => run_channel_scan(client, page_size, plan).await?,
        QueryPlan::Messages(plan) => run_messages(client, page_size, plan).await?,
        QueryPlan::Members(plan) => run_members(client, page_size, plan).await?,
    };
    Ok(Translation::Rows(rows))
}

fn row_identity(row: &Value, key: &str) -> Option<i64> {
    row.get(key).and_then(value_as_i64)
}

/// Walk a filtered table in offset order until a short page signals the end.
/// Pages may overlap when the filter set is large, so rows are de-duplicated
/// by their identity column; the accumulator lives only for this call.
pub(super) async fn fetch_paged(
    client: &RestClient,
    table: &str,
    base: &TableQuery,
    key: &str,
    page_size: usize,
) -> Result<Vec<Value>, DatabaseError> {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        let page = client
            .select(table, &base.clone().range(offset, page_size))
            .await?;
        let page_len = page.len();
        for row in page {
            match row_identity(&row, key) {
                Some(id) if !seen.insert(id) => {}
                _ => rows.push(row),
            }
        }
        if page_len < page_size {
            break;
        }
        offset += page_size;
    }
    Ok(rows)
}

/// Two-phase category expansion: resolve the channel→category mapping, then
/// widen the channel identity set with every channel in a listed category.
async fn expand_category_channels(
    client: &RestClient,
    page_size: usize,
    channel_ids: &[i64],
    category_ids: &[i64],
) -> Result<Vec<i64>, DatabaseError> {
    let query = TableQuery::new().select("channel_id,category_id");
    let channels = fetch_paged(client, CHANNELS_TABLE, &query, "channel_id", page_size).await?;

    let mut expanded: HashSet<i64> = channel_ids.iter().copied().collect();
    for channel in &channels {
        let Some(id) = row_identity(channel, "channel_id") else {
            continue;
        };
        if let Some(category) = channel.get("category_id").and_then(value_as_i64)
            && category_ids.contains(&category)
        {
            expanded.insert(id);
        }
    }
    let mut expanded: Vec<i64> = expanded.into_iter().collect();
    expanded.sort_unstable();
    Ok(expanded)
}

fn attachments_of(row: &ResultRow) -> Vec<Value> {
    match row.get("attachments") {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn has_attachments(row: &ResultRow) -> bool {
    !attachments_of(row).is_empty()
}

fn has_video_attachment(row: &ResultRow) -> bool {
    attachments_of(row).iter().any(|attachment| {
        ["url", "filename"].iter().any(|field| {
            attachment
                .get(*field)
                .and_then(Value::as_str)
                .map(|text| {
                    let lowered = text.to_lowercase();
                    VIDEO_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
                })
                .unwrap_or(false)
        })
    })
}

fn row_i64(row: &ResultRow, key: &str) -> i64 {
    row.get(key).and_then(value_as_i64).unwrap_or(0)
}

fn row_str<'a>(row: &'a ResultRow, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or("")
}

fn apply_order(rows: &mut [ResultRow], order: OrderSpec) {
    match order {
        OrderSpec::ReactorsDesc => rows.sort_by(|a, b| {
            row_i64(b, "unique_reactor_count")
                .cmp(&row_i64(a, "unique_reactor_count"))
                .then_with(|| row_str(b, "created_at").cmp(row_str(a, "created_at")))
        }),
        OrderSpec::CreatedDesc => {
            rows.sort_by(|a, b| row_str(b, "created_at").cmp(row_str(a, "created_at")));
        }
        OrderSpec::CreatedAsc => {
            rows.sort_by(|a, b| row_str(a, "created_at").cmp(row_str(b, "created_at")));
        }
        OrderSpec::Unordered => {}
    }
}

fn project(rows: Vec<ResultRow>, columns: &[String]) -> Vec<ResultRow> {
    rows.into_iter()
        .map(|row| {
            let mut out = ResultRow::new();
            for column in columns {
                out.insert(
                    column.clone(),
                    row.get(column).cloned().unwrap_or(Value::Null),
                );
            }
            out
        })
        .collect()
}

pub(super) async fn fetch_member_names(
    client: &RestClient,
    author_ids: &[i64],
) -> Result<HashMap<i64, String>, DatabaseError> {
    let mut names = HashMap::new();
    for chunk in author_ids.chunks(MEMBER_BATCH) {
        let query = TableQuery::new()
            .select("member_id,username,global_name,server_nick")
            .in_list("member_id", chunk);
        let members = client.select(MEMBERS_TABLE, &query).await?;
        for member in members {
            if let Some(id) = row_identity(&member, "member_id") {
                names.insert(id, display_name_of(&member));
            }
        }
    }
    Ok(names)
}

async fn fetch_channel_names(
    client: &RestClient,
    channel_ids: &[i64],
) -> Result<HashMap<i64, String>, DatabaseError> {
    if channel_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let query = TableQuery::new()
        .select("channel_id,channel_name")
        .in_list("channel_id", channel_ids);
    let channels = client.select(CHANNELS_TABLE, &query).await?;
    let mut names = HashMap::new();
    for channel in channels {
        if let Some(id) = row_identity(&channel, "channel_id") {
            let name = channel
                .get("channel_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            names.insert(id, name);
        }
    }
    Ok(names)
}

fn distinct_ids(rows: &[ResultRow], key: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .filter_map(|row| row.get(key).and_then(value_as_i64))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

async fn run_messages(
    client: &RestClient,
    page_size: usize,
    plan: MessageQueryPlan,
) -> Result<Vec<ResultRow>, DatabaseError> {
    let mut channel_ids = plan.channel_ids;
    if !plan.category_ids.is_empty() {
        channel_ids =
            expand_category_channels(client, page_size, &channel_ids, &plan.category_ids).await?;
        // A channel predicate that expands to nothing can match nothing.
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }
    }

    let mut query = TableQuery::new();
    if !channel_ids.is_empty() {
        query = query.in_list("channel_id", &channel_ids);
    }
    match plan.message_ids.as_slice() {
        [] => {}
        [only] => query = query.eq("message_id", only),
        many => query = query.in_list("message_id", many),
    }
    if let Some(after) = &plan.created_after {
        query = query.gte("created_at", &normalize_timestamp(after));
    }

    let fetched = fetch_paged(client, MESSAGES_TABLE, &query, "message_id", page_size).await?;
    let mut rows: Vec<ResultRow> = fetched.iter().map(normalize_message_row).collect();

    if plan.require_attachments {
        rows.retain(has_attachments);
    }
    if plan.require_video {
        rows.retain(has_video_attachment);
    }
    if let Some(min) = plan.min_reactors {
        rows.retain(|row| row_i64(row, "unique_reactor_count") >= min);
    }

    if plan.want_author_name {
        let author_ids = distinct_ids(&rows, "author_id");
        if !author_ids.is_empty() {
            let names = fetch_member_names(client, &author_ids).await?;
            for row in &mut rows {
                if let Some(id) = row.get("author_id").and_then(value_as_i64) {
                    let name = names.get(&id).cloned().unwrap_or_else(|| "Unknown".to_string());
                    row.insert("author_name".to_string(), Value::String(name));
                }
            }
        }
    }

    if plan.want_channel_name || plan.exclude_nsfw {
        let present = distinct_ids(&rows, "channel_id");
        let names = fetch_channel_names(client, &present).await?;
        if plan.exclude_nsfw {
            rows.retain(|row| {
                row.get("channel_id")
                    .and_then(value_as_i64)
                    .and_then(|id| names.get(&id))
                    .map(|name| !name.to_lowercase().contains("nsfw"))
                    .unwrap_or(true)
            });
        }
        if plan.want_channel_name {
            for row in &mut rows {
                if let Some(name) = row
                    .get("channel_id")
                    .and_then(value_as_i64)
                    .and_then(|id| names.get(&id))
                {
                    row.insert("channel_name".to_string(), Value::String(name.clone()));
                }
            }
        }
    }

    if plan.group_by_channel {
        return Ok(distinct_ids(&rows, "channel_id")
            .into_iter()
            .map(|id| {
                let mut row = ResultRow::new();
                row.insert("channel_id".to_string(), Value::from(id));
                row
            })
            .collect());
    }

    apply_order(&mut rows, plan.order);
    if let Some(limit) = plan.limit {
        rows.truncate(limit);
    }
    if let Some(columns) = &plan.projection {
        rows = project(rows, columns);
    }
    Ok(rows)
}

async fn run_channel_rollup(
    client: &RestClient,
    page_size: usize,
    plan: ChannelRollupPlan,
) -> Result<Vec<ResultRow>, DatabaseError> {
    let query = TableQuery::new().select("channel_id,channel_name,category_id");
    let channels = fetch_paged(client, CHANNELS_TABLE, &query, "channel_id", page_size).await?;

    let unfiltered = plan.channel_ids.is_empty() && plan.category_ids.is_empty();
    let mut targets: Vec<(i64, String)> = Vec::new();
    for channel in &channels {
        let Some(id) = row_identity(channel, "channel_id") else {
            continue;
        };
        let in_categories = channel
            .get("category_id")
            .and_then(value_as_i64)
            .map(|category| plan.category_ids.contains(&category))
            .unwrap_or(false);
        if unfiltered || plan.channel_ids.contains(&id) || in_categories {
            let name = channel
                .get("channel_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            targets.push((id, name));
        }
    }
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let cutoff = Utc::now() - chrono::Duration::hours(plan.window_hours);
    let target_ids: Vec<i64> = targets.iter().map(|(id, _)| *id).collect();
    let query = TableQuery::new()
        .select("message_id,channel_id")
        .in_list("channel_id", &target_ids)
        .gt("created_at", &cutoff.format(TS_FORMAT).to_string());
    let messages = fetch_paged(client, MESSAGES_TABLE, &query, "message_id", page_size).await?;

    let mut counts: HashMap<i64, i64> = HashMap::new();
    for message in &messages {
        if let Some(channel) = message.get("channel_id").and_then(value_as_i64) {
            *counts.entry(channel).or_insert(0) += 1;
        }
    }

    let mut rows: Vec<ResultRow> = targets
        .into_iter()
        .filter_map(|(id, name)| {
            let count = counts.get(&id).copied().unwrap_or(0);
            if count < plan.min_messages {
                return None;
            }
            let mut row = ResultRow::new();
            row.insert("channel_id".to_string(), Value::from(id));
            row.insert("channel_name".to_string(), Value::String(name));
            row.insert("msg_count".to_string(), Value::from(count));
            Some(row)
        })
        .collect();

    rows.sort_by(|a, b| {
        row_i64(b, "msg_count")
            .cmp(&row_i64(a, "msg_count"))
            .then_with(|| row_i64(a, "channel_id").cmp(&row_i64(b, "channel_id")))
    });
    Ok(rows)
}

async fn run_channel_scan(
    client: &RestClient,
    page_size: usize,
    plan: ChannelScanPlan,
) -> Result<Vec<ResultRow>, DatabaseError> {
    let mut query = TableQuery::new();
    if !plan.channel_ids.is_empty() {
        query = query.in_list("channel_id", &plan.channel_ids);
    }
    if let Some(flag) = plan.setup_complete {
        query = query.eq("setup_complete", flag);
    }
    if let Some((negated, pattern)) = &plan.name_like {
        query = if *negated {
            query.not_ilike("channel_name", pattern)
        } else {
            query.ilike("channel_name", pattern)
        };
    }

    let fetched = fetch_paged(client, CHANNELS_TABLE, &query, "channel_id", page_size).await?;
    let mut rows: Vec<ResultRow> = fetched.iter().map(normalize_plain_row).collect();
    rows.sort_by_key(|row| row_i64(row, "channel_id"));

    if let Some(limit) = plan.limit {
        rows.truncate(limit);
    }
    if let Some(columns) = &plan.projection {
        rows = project(rows, columns);
    }
    Ok(rows)
}

async fn run_members(
    client: &RestClient,
    page_size: usize,
    plan: MemberQueryPlan,
) -> Result<Vec<ResultRow>, DatabaseError> {
    let mut query = TableQuery::new();
    if !plan.member_ids.is_empty() {
        query = query.in_list("member_id", &plan.member_ids);
    }
    if let Some(flag) = plan.sharing_consent {
        query = query.eq("sharing_consent", flag);
    }

    let fetched = fetch_paged(client, MEMBERS_TABLE, &query, "member_id", page_size).await?;
    let mut rows: Vec<ResultRow> = fetched.iter().map(normalize_plain_row).collect();
    rows.sort_by_key(|row| row_i64(row, "member_id"));

    if let Some(limit) = plan.limit {
        rows.truncate(limit);
    }
    if let Some(columns) = &plan.projection {
        rows = project(rows, columns);
    }
    Ok(rows)
}
