use crate::api::error::AppError;
use crate::entities::{files, prelude::*, users};
use crate::utils::validation::{AUDIO_EXTENSIONS, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use chrono::{Datelike, NaiveDate, Utc};
use sea_orm::sea_query::{Expr, LikeExpr, SimpleExpr};
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, EntityTrait, Order, QueryFilter};

/// Caps applied to non-moderator queries.
pub const MAX_TEXT_QUERIES: usize = 3;
pub const MAX_WILDCARDS_IN_KEY: usize = 2;
pub const MAX_SORT_KEYS: usize = 1;
pub const MAX_IS_KEYS: usize = 1;

/// Sentinel value rewriting a keyed term into a NULL predicate.
const NULL_SENTINEL: &str = "-";

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Caller is a moderator; lifts the complexity caps.
    pub moderator: bool,
    /// Caller asked for every user's uploads (moderator-only listing mode).
    pub list_all: bool,
    /// Scope results to one user. None when listing all.
    pub scope_userid: Option<i64>,
    /// Listing inside one album; suppresses albumid keys.
    pub album_scope: Option<i64>,
    /// Client-reported timezone offset in minutes (JS `getTimezoneOffset`).
    pub tz_offset_minutes: i32,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: files::Column,
    pub order: Order,
    pub nulls_last: bool,
}

/// The compiled listing query: a fully parameterized WHERE tree plus an
/// ORDER BY list. Default order is `id DESC`.
#[derive(Debug)]
pub struct CompiledQuery {
    pub condition: Condition,
    pub order: Vec<SortKey>,
}

#[derive(Debug, Default)]
struct ParsedFilters {
    users_inc: Vec<String>,
    users_exc: Vec<String>,
    user_null_inc: bool,
    user_null_exc: bool,
    ips_inc: Vec<String>,
    ips_exc: Vec<String>,
    ip_null_inc: bool,
    ip_null_exc: bool,
    albumids_inc: Vec<i64>,
    albumids_exc: Vec<i64>,
    types_inc: Vec<String>,
    types_exc: Vec<String>,
    is_inc: Vec<&'static [&'static str]>,
    is_exc: Vec<&'static [&'static str]>,
    date_from: Option<i64>,
    date_to: Option<i64>,
    expiry_from: Option<i64>,
    expiry_to: Option<i64>,
    sorts: Vec<(String, Order)>,
    text_inc: Vec<String>,
    text_exc: Vec<String>,
}

/// Split a filter string on whitespace, honoring double quotes so that
/// `date:"2021/01 12:00"` stays one token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Translate glob wildcards into a LIKE pattern, escaping any literal
/// `%`/`_`/`\` the user supplied. Patterns are matched with `ESCAPE '\'`.
fn glob_to_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

fn wildcard_count(value: &str) -> usize {
    value.chars().filter(|c| *c == '*' || *c == '?').count()
}

/// Parse a duration like `30m`, `12h`, `7d`, `1w` or `2d12h` into seconds.
fn parse_duration_secs(input: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut digits = String::new();
    let mut matched = false;

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            'w' => 7 * 86400,
            _ => return None,
        };
        total += value * unit;
        matched = true;
    }
    if !digits.is_empty() {
        // A bare number is seconds.
        total += digits.parse::<i64>().ok()?;
        matched = true;
    }
    matched.then_some(total)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(28)
}

/// Parse `[YYYY][/MM][/DD] [HH][:MM][:SS]` into the epoch range it denotes,
/// adjusted by the client timezone offset.
fn parse_date_range(value: &str, tz_offset_minutes: i32) -> Option<(i64, i64)> {
    let mut parts = value.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next();
    if parts.next().is_some() {
        return None;
    }

    let mut date_bits = date_part.split('/');
    let year: i32 = date_bits.next()?.parse().ok()?;
    let month: Option<u32> = date_bits.next().map(|v| v.parse().ok()).flatten_invalid()?;
    let day: Option<u32> = date_bits.next().map(|v| v.parse().ok()).flatten_invalid()?;
    if date_bits.next().is_some() {
        return None;
    }

    let (mut hour, mut minute, mut second) = (None, None, None);
    if let Some(time) = time_part {
        let mut time_bits = time.split(':');
        hour = Some(time_bits.next()?.parse::<u32>().ok()?);
        minute = time_bits.next().map(|v| v.parse().ok()).flatten_invalid()?;
        second = time_bits.next().map(|v| v.parse().ok()).flatten_invalid()?;
        if time_bits.next().is_some() {
            return None;
        }
    }

    // Missing components clamp to the start of their period for the lower
    // bound and to its end for the upper bound.
    let from = NaiveDate::from_ymd_opt(year, month.unwrap_or(1), day.unwrap_or(1))?
        .and_hms_opt(hour.unwrap_or(0), minute.unwrap_or(0), second.unwrap_or(0))?;
    let to = NaiveDate::from_ymd_opt(
        year,
        month.unwrap_or(12),
        day.unwrap_or(days_in_month(year, month.unwrap_or(12))),
    )?
    .and_hms_opt(hour.unwrap_or(23), minute.unwrap_or(59), second.unwrap_or(59))?;

    let offset = tz_offset_minutes as i64 * 60;
    Some((
        from.and_utc().timestamp() + offset,
        to.and_utc().timestamp() + offset + 1,
    ))
}

/// `Iterator::next` gave us `Option<Option<T>>`; collapse invalid parses
/// into an overall failure instead of silently dropping them.
trait FlattenInvalid<T> {
    fn flatten_invalid(self) -> Option<Option<T>>;
}

impl<T> FlattenInvalid<T> for Option<Option<T>> {
    fn flatten_invalid(self) -> Option<Option<T>> {
        match self {
            None => Some(None),
            Some(None) => None,
            Some(Some(v)) => Some(Some(v)),
        }
    }
}

fn is_extensions(value: &str) -> Option<&'static [&'static str]> {
    match value {
        "image" => Some(&IMAGE_EXTENSIONS),
        "video" => Some(&VIDEO_EXTENSIONS),
        "audio" => Some(&AUDIO_EXTENSIONS),
        _ => None,
    }
}

fn merge_range(
    from: &mut Option<i64>,
    to: &mut Option<i64>,
    new_from: Option<i64>,
    new_to: Option<i64>,
) {
    if let Some(f) = new_from {
        *from = Some(from.map_or(f, |cur| cur.max(f)));
    }
    if let Some(t) = new_to {
        *to = Some(to.map_or(t, |cur| cur.min(t)));
    }
}

/// Parse one `date:`/`expiry:` term into an epoch range. Relative durations
/// look backwards for upload dates (`date:<7d` = newer than a week) and
/// forwards for expiries (`expiry:<7d` = expires within a week).
fn parse_range_term(
    value: &str,
    tz_offset_minutes: i32,
    now: i64,
    future: bool,
) -> Result<(Option<i64>, Option<i64>), String> {
    if let Some(duration) = value.strip_prefix('<') {
        let secs = parse_duration_secs(duration)
            .ok_or_else(|| format!("Invalid duration: {duration}"))?;
        return Ok(if future {
            (None, Some(now + secs))
        } else {
            (Some(now - secs), None)
        });
    }
    if let Some(duration) = value.strip_prefix('>') {
        let secs = parse_duration_secs(duration)
            .ok_or_else(|| format!("Invalid duration: {duration}"))?;
        return Ok(if future {
            (Some(now + secs), None)
        } else {
            (None, Some(now - secs))
        });
    }
    let (from, to) = parse_date_range(value, tz_offset_minutes)
        .ok_or_else(|| format!("Invalid date: {value}"))?;
    Ok((Some(from), Some(to)))
}

fn parse(filters: &str, opts: &CompileOptions) -> Result<ParsedFilters, AppError> {
    let mut parsed = ParsedFilters::default();
    let now = Utc::now().timestamp();

    for token in tokenize(filters) {
        let (negated, body) = match token.strip_prefix('-') {
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, token.as_str()),
        };

        let Some((key, value)) = body.split_once(':').filter(|(k, v)| {
            !v.is_empty()
                && matches!(
                    *k,
                    "user" | "ip" | "albumid" | "type" | "date" | "expiry" | "is" | "sort"
                        | "orderby"
                )
        }) else {
            // Free-text term over name and original.
            if negated {
                parsed.text_exc.push(body.to_string());
            } else {
                parsed.text_inc.push(body.to_string());
            }
            continue;
        };

        if !opts.moderator && wildcard_count(value) > MAX_WILDCARDS_IN_KEY {
            return Err(AppError::BadRequest(format!(
                "Users are only allowed up to {MAX_WILDCARDS_IN_KEY} wildcards per key."
            )));
        }

        match key {
            "user" => {
                if !(opts.moderator && opts.list_all) {
                    return Err(AppError::Forbidden(
                        "You are not allowed to filter by user.".to_string(),
                    ));
                }
                match (value, negated) {
                    (NULL_SENTINEL, false) => parsed.user_null_inc = true,
                    (NULL_SENTINEL, true) => parsed.user_null_exc = true,
                    (v, false) => parsed.users_inc.push(v.to_string()),
                    (v, true) => parsed.users_exc.push(v.to_string()),
                }
            }
            "ip" => {
                if !(opts.moderator && opts.list_all) {
                    return Err(AppError::Forbidden(
                        "You are not allowed to filter by IP.".to_string(),
                    ));
                }
                match (value, negated) {
                    (NULL_SENTINEL, false) => parsed.ip_null_inc = true,
                    (NULL_SENTINEL, true) => parsed.ip_null_exc = true,
                    (v, false) => parsed.ips_inc.push(v.to_string()),
                    (v, true) => parsed.ips_exc.push(v.to_string()),
                }
            }
            "albumid" => {
                // Inside an album listing the scope wins; the key is dropped.
                if opts.album_scope.is_some() {
                    continue;
                }
                let id: i64 = value.parse().map_err(|_| {
                    AppError::BadRequest(format!("Invalid album id: {value}"))
                })?;
                if negated {
                    parsed.albumids_exc.push(id);
                } else {
                    parsed.albumids_inc.push(id);
                }
            }
            "type" => {
                if negated {
                    parsed.types_exc.push(value.to_string());
                } else {
                    parsed.types_inc.push(value.to_string());
                }
            }
            "is" => {
                let extensions = is_extensions(value).ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Invalid is: key, expected image, video or audio: {value}"
                    ))
                })?;
                if negated {
                    parsed.is_exc.push(extensions);
                } else {
                    parsed.is_inc.push(extensions);
                }
            }
            "date" => {
                let (from, to) = parse_range_term(value, opts.tz_offset_minutes, now, false)
                    .map_err(AppError::BadRequest)?;
                merge_range(&mut parsed.date_from, &mut parsed.date_to, from, to);
            }
            "expiry" => {
                let (from, to) = parse_range_term(value, opts.tz_offset_minutes, now, true)
                    .map_err(AppError::BadRequest)?;
                merge_range(&mut parsed.expiry_from, &mut parsed.expiry_to, from, to);
            }
            "sort" | "orderby" => {
                let (column, order) = match value.rsplit_once(':') {
                    Some((col, "asc")) => (col, Order::Asc),
                    Some((col, "desc")) => (col, Order::Desc),
                    _ => (value, Order::Asc),
                };
                parsed.sorts.push((column.to_string(), order));
            }
            _ => unreachable!("key list checked above"),
        }
    }

    if !opts.moderator {
        if parsed.text_inc.len() + parsed.text_exc.len() > MAX_TEXT_QUERIES {
            return Err(AppError::BadRequest(format!(
                "Users are only allowed up to {MAX_TEXT_QUERIES} text queries at once."
            )));
        }
        if parsed.sorts.len() > MAX_SORT_KEYS {
            return Err(AppError::BadRequest(format!(
                "Users are only allowed up to {MAX_SORT_KEYS} sort key at once."
            )));
        }
        if parsed.is_inc.len() + parsed.is_exc.len() > MAX_IS_KEYS {
            return Err(AppError::BadRequest(format!(
                "Users are only allowed up to {MAX_IS_KEYS} is: key at once."
            )));
        }
    }

    Ok(parsed)
}

fn like_expr(column: files::Column, pattern: String) -> SimpleExpr {
    Expr::col((files::Entity, column)).like(LikeExpr::new(pattern).escape('\\'))
}

fn not_like_expr(column: files::Column, pattern: String) -> SimpleExpr {
    Expr::col((files::Entity, column)).not_like(LikeExpr::new(pattern).escape('\\'))
}

fn suffix_condition(extensions: &[&str]) -> Condition {
    let mut any = Condition::any();
    for ext in extensions {
        any = any.add(like_expr(
            files::Column::Name,
            format!("%{}", glob_to_like(ext)),
        ));
    }
    any
}

async fn resolve_usernames(
    db: &DatabaseConnection,
    names: &[String],
) -> Result<Vec<i64>, AppError> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let found = Users::find()
        .filter(users::Column::Username.is_in(names.iter().cloned()))
        .all(db)
        .await?;
    let mut ids: Vec<i64> = found.iter().map(|u| u.id).collect();
    if ids.is_empty() {
        // Unknown usernames must match nothing, not everything.
        ids.push(-1);
    }
    Ok(ids)
}

fn sort_column(name: &str, opts: &CompileOptions) -> Result<(files::Column, bool), AppError> {
    let (column, nulls_last) = match name {
        "id" => (files::Column::Id, false),
        "name" => (files::Column::Name, false),
        "original" => (files::Column::Original, false),
        "size" => (files::Column::Size, false),
        "timestamp" | "date" => (files::Column::Timestamp, false),
        "expirydate" | "expiry" => (files::Column::Expirydate, true),
        "userid" | "ip" => {
            if !(opts.moderator && opts.list_all) {
                return Err(AppError::Forbidden(format!(
                    "You are not allowed to sort by {name}."
                )));
            }
            match name {
                "userid" => (files::Column::Userid, true),
                _ => (files::Column::Ip, true),
            }
        }
        other => {
            return Err(AppError::BadRequest(format!("Invalid sort key: {other}")));
        }
    };
    Ok((column, nulls_last))
}

/// Compile a user-supplied filter string into a parameterized query.
pub async fn compile(
    db: &DatabaseConnection,
    filters: &str,
    opts: &CompileOptions,
) -> Result<CompiledQuery, AppError> {
    let parsed = parse(filters, opts)?;
    let mut cond = Condition::all();

    // Caller scope.
    if let Some(userid) = opts.scope_userid {
        cond = cond.add(files::Column::Userid.eq(userid));
    }
    if let Some(albumid) = opts.album_scope {
        cond = cond.add(files::Column::Albumid.eq(albumid));
    }

    // user: / -user:
    if !parsed.users_inc.is_empty() || (parsed.user_null_inc && !parsed.user_null_exc) {
        let mut any = Condition::any();
        if !parsed.users_inc.is_empty() {
            let ids = resolve_usernames(db, &parsed.users_inc).await?;
            any = any.add(files::Column::Userid.is_in(ids));
        }
        // Exclusion takes precedence when both sentinels are present.
        if parsed.user_null_inc && !parsed.user_null_exc {
            any = any.add(files::Column::Userid.is_null());
        }
        cond = cond.add(any);
    }
    if !parsed.users_exc.is_empty() {
        let ids = resolve_usernames(db, &parsed.users_exc).await?;
        cond = cond.add(
            Condition::any()
                .add(files::Column::Userid.is_not_in(ids))
                .add(files::Column::Userid.is_null()),
        );
    }
    if parsed.user_null_exc {
        cond = cond.add(files::Column::Userid.is_not_null());
    }

    // ip: / -ip:
    if !parsed.ips_inc.is_empty() || (parsed.ip_null_inc && !parsed.ip_null_exc) {
        let mut any = Condition::any();
        if !parsed.ips_inc.is_empty() {
            any = any.add(files::Column::Ip.is_in(parsed.ips_inc.clone()));
        }
        if parsed.ip_null_inc && !parsed.ip_null_exc {
            any = any.add(files::Column::Ip.is_null());
        }
        cond = cond.add(any);
    }
    if !parsed.ips_exc.is_empty() {
        cond = cond.add(
            Condition::any()
                .add(files::Column::Ip.is_not_in(parsed.ips_exc.clone()))
                .add(files::Column::Ip.is_null()),
        );
    }
    if parsed.ip_null_exc {
        cond = cond.add(files::Column::Ip.is_not_null());
    }

    // albumid:
    if !parsed.albumids_inc.is_empty() {
        cond = cond.add(files::Column::Albumid.is_in(parsed.albumids_inc.clone()));
    }
    if !parsed.albumids_exc.is_empty() {
        cond = cond.add(
            Condition::any()
                .add(files::Column::Albumid.is_not_in(parsed.albumids_exc.clone()))
                .add(files::Column::Albumid.is_null()),
        );
    }

    // date: / expiry:
    if let Some(from) = parsed.date_from {
        cond = cond.add(files::Column::Timestamp.gte(from));
    }
    if let Some(to) = parsed.date_to {
        cond = cond.add(files::Column::Timestamp.lt(to));
    }
    if let Some(from) = parsed.expiry_from {
        cond = cond.add(files::Column::Expirydate.gte(from));
    }
    if let Some(to) = parsed.expiry_to {
        cond = cond.add(files::Column::Expirydate.lt(to));
    }

    // is:
    for extensions in &parsed.is_inc {
        cond = cond.add(suffix_condition(extensions));
    }
    for extensions in &parsed.is_exc {
        cond = cond.add(suffix_condition(extensions).not());
    }

    // type:
    for pattern in &parsed.types_inc {
        if wildcard_count(pattern) > 0 {
            cond = cond.add(like_expr(files::Column::Mime, glob_to_like(pattern)));
        } else {
            cond = cond.add(files::Column::Mime.eq(pattern.clone()));
        }
    }
    for pattern in &parsed.types_exc {
        if wildcard_count(pattern) > 0 {
            cond = cond.add(not_like_expr(files::Column::Mime, glob_to_like(pattern)));
        } else {
            cond = cond.add(files::Column::Mime.ne(pattern.clone()));
        }
    }

    // Free text over name and original.
    for term in &parsed.text_inc {
        let pattern = format!("%{}%", glob_to_like(term));
        cond = cond.add(
            Condition::any()
                .add(like_expr(files::Column::Name, pattern.clone()))
                .add(like_expr(files::Column::Original, pattern)),
        );
    }
    for term in &parsed.text_exc {
        let pattern = format!("%{}%", glob_to_like(term));
        cond = cond.add(
            Condition::all()
                .add(not_like_expr(files::Column::Name, pattern.clone()))
                .add(not_like_expr(files::Column::Original, pattern)),
        );
    }

    // Sorts, defaulting to newest first.
    let mut order = Vec::new();
    for (name, direction) in &parsed.sorts {
        let (column, nulls_last) = sort_column(name, opts)?;
        order.push(SortKey {
            column,
            order: direction.clone(),
            nulls_last,
        });
    }
    if order.is_empty() {
        order.push(SortKey {
            column: files::Column::Id,
            order: Order::Desc,
            nulls_last: false,
        });
    }

    Ok(CompiledQuery {
        condition: cond,
        order,
    })
}

/// Resolve a possibly negative page number; negative pages address from the
/// tail of the result set.
pub fn resolve_page(requested: i64, total: u64, page_size: u64) -> u64 {
    if requested >= 0 {
        return requested as u64;
    }
    let pages = total.div_ceil(page_size.max(1)) as i64;
    (pages + requested).max(0) as u64
}
