//! Expansion joins, reconciliation, quota sampling and snapshot comparison over CMRT tables.

use std::collections::{BTreeMap, HashSet};

use cmrt_core::columns::{
    AREA, BRANCH_ID, BRANCH_NAME, CI_CODE, COMPANY_ID, COMPLIANCE_INDICATOR, EMPLOYEE_ID,
    EVIDENCE_FILE, LOB, PROCESS, SCORE, STATUS, SUB_WP, TOTAL_SAMPLE,
};
use cmrt_core::{compliance_code, parse_numeric, Cell, SetupStatus, Table, TableError, LOB_CATALOG};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cmrt-recon";

/// Score assigned when there was nothing to sample.
pub const FULL_SCORE: &str = "100";
pub const DEFAULT_SAMPLE_SEED: u64 = 42;
/// Breakdown label for rows whose grouping value is null.
pub const UNASSIGNED_GROUP: &str = "(unassigned)";

pub const SETUP_JOIN_KEYS: [&str; 2] = [BRANCH_ID, LOB];
pub const WORK_PAPER_JOIN_KEYS: [&str; 5] = [BRANCH_ID, LOB, SUB_WP, PROCESS, CI_CODE];
/// Fields that both the expected universe and uploaded progress sheets tend to carry.
pub const DUPLICATE_PRONE_FIELDS: [&str; 5] =
    [AREA, COMPANY_ID, BRANCH_NAME, EVIDENCE_FILE, COMPLIANCE_INDICATOR];

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("{input} table is missing column `{column}`")]
    MissingColumn { input: String, column: String },
    #[error("column `{column}` exists on both sides of the expansion")]
    ColumnCollision { column: String },
    #[error("actual table repeats join key [{key}]")]
    DuplicateActualKey { key: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

fn column_in(table: &Table, input: &str, column: &str) -> Result<usize, ReconError> {
    table
        .column_index(column)
        .map_err(|_| ReconError::MissingColumn {
            input: input.to_string(),
            column: column.to_string(),
        })
}

fn columns_in(table: &Table, input: &str, columns: &[&str]) -> Result<Vec<usize>, ReconError> {
    columns.iter().map(|c| column_in(table, input, c)).collect()
}

/// Repeats every base row once per catalog value, placing the value in `column`.
///
/// The result has exactly `base.height() * catalog.len()` rows, base-row major,
/// catalog order within. Duplicates on either side are kept.
pub fn expand_catalog<S: AsRef<str>>(
    base: &Table,
    column: &str,
    catalog: &[S],
) -> Result<Table, ReconError> {
    let rows = catalog
        .iter()
        .map(|value| vec![Some(value.as_ref().to_string())])
        .collect();
    cross_join(base, &Table::from_rows([column], rows)?)
}

/// Full cross join: every base row paired with every catalog row, all columns kept.
pub fn cross_join(base: &Table, catalog: &Table) -> Result<Table, ReconError> {
    if let Some(column) = catalog.columns().into_iter().find(|c| base.has_column(c)) {
        return Err(ReconError::ColumnCollision { column });
    }
    Ok(base.cross_join(catalog)?)
}

/// Which side wins when a field exists on both sides of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    #[default]
    ExpectedFirst,
    ActualFirst,
}

impl Preference {
    pub fn resolve(self, expected: Option<&str>, actual: Option<&str>) -> Cell {
        let (first, second) = match self {
            Self::ExpectedFirst => (expected, actual),
            Self::ActualFirst => (actual, expected),
        };
        first.or(second).map(str::to_string)
    }
}

/// Handling of actual-side rows that share a join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// First row in input order wins; later ones are counted and ignored.
    #[default]
    FirstMatch,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRule {
    pub presence_column: String,
    pub status_column: String,
    pub matched: String,
    pub unmatched: String,
}

impl StatusRule {
    /// `STATUS` is `Configured` when an employee id was joined in, else `NotConfigured`.
    pub fn setup() -> Self {
        Self {
            presence_column: EMPLOYEE_ID.to_string(),
            status_column: STATUS.to_string(),
            matched: SetupStatus::Configured.as_str().to_string(),
            unmatched: SetupStatus::NotConfigured.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub duplicate_keys: DuplicateKeyPolicy,
    /// Per-field preference for fields present on both sides; unlisted fields prefer expected.
    pub preferences: BTreeMap<String, Preference>,
    pub status: Option<StatusRule>,
    pub score_floor: bool,
}

impl ReconcileOptions {
    pub fn with_duplicate_keys(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_keys = policy;
        self
    }

    pub fn with_preference(mut self, field: &str, preference: Preference) -> Self {
        self.preferences.insert(field.to_string(), preference);
        self
    }

    pub fn with_status(mut self, rule: StatusRule) -> Self {
        self.status = Some(rule);
        self
    }

    pub fn with_score_floor(mut self) -> Self {
        self.score_floor = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub table: Table,
    pub matched: usize,
    pub unmatched: usize,
    /// Actual-side rows ignored because an earlier row had the same key.
    pub duplicate_actual_rows: usize,
}

/// Marks joined actual rows so matches survive null-only actual fields.
const MATCH_MARKER: &str = "__cmrt_matched";
/// Suffix for actual-side copies of fields the expected side also carries.
const ACTUAL_SUFFIX: &str = "__actual";

fn describe_key(key: &[Option<&str>]) -> String {
    key.iter()
        .map(|k| k.unwrap_or("<null>"))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// First key tuple that occurs twice in `table`, in input order.
fn first_repeated_key(table: &Table, keys: &[&str]) -> Result<Option<String>, ReconError> {
    let columns = keys
        .iter()
        .map(|k| table.column_values(k))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    for row in 0..table.height() {
        let key: Vec<Option<&str>> = columns.iter().map(|c| c[row]).collect();
        if seen.contains(&key) {
            return Ok(Some(describe_key(&key)));
        }
        seen.insert(key);
    }
    Ok(None)
}

/// Left outer join of `expected` against `actual` on `join_keys`.
///
/// Every expected row appears exactly once. Key cells compare exactly, null
/// equal to null. Non-key fields present on both sides collapse into the
/// expected-side column using the configured [`Preference`]; actual-only
/// fields are appended in actual order and are null for unmatched rows.
pub fn reconcile(
    expected: &Table,
    actual: &Table,
    join_keys: &[&str],
    options: &ReconcileOptions,
) -> Result<Reconciled, ReconError> {
    columns_in(expected, "expected", join_keys)?;
    columns_in(actual, "actual", join_keys)?;

    if options.duplicate_keys == DuplicateKeyPolicy::Reject {
        if let Some(key) = first_repeated_key(actual, join_keys)? {
            return Err(ReconError::DuplicateActualKey { key });
        }
    }
    let mut right = actual.unique_first(join_keys)?;
    let duplicate_actual_rows = actual.height() - right.height();
    if duplicate_actual_rows > 0 {
        warn!(
            duplicate_actual_rows,
            "actual table repeats join keys; keeping the first row per key"
        );
    }

    let mut overlap = Vec::new();
    for name in actual.columns() {
        if join_keys.contains(&name.as_str()) || !expected.has_column(&name) {
            continue;
        }
        let split = format!("{name}{ACTUAL_SUFFIX}");
        right = right.rename_column(&name, &split)?;
        let preference = options.preferences.get(&name).copied().unwrap_or_default();
        overlap.push((name, split, preference));
    }
    let marker = vec![Some("1".to_string()); right.height()];
    let right = right.with_column(MATCH_MARKER, marker)?;

    let joined = expected.left_join(&right, join_keys)?;
    let matched = joined.strings(MATCH_MARKER)?.into_iter().flatten().count();
    let mut table = joined.drop_columns(&[MATCH_MARKER]);
    for (name, split, preference) in &overlap {
        table = coalesce_columns(&table, name, split, name, *preference)?;
    }

    if let Some(rule) = &options.status {
        table = derive_status(&table, rule)?;
    }
    if options.score_floor {
        table = apply_score_floor(&table)?;
    }

    debug!(
        expected = expected.height(),
        actual = actual.height(),
        matched,
        "reconciled tables"
    );
    Ok(Reconciled {
        unmatched: table.height() - matched,
        table,
        matched,
        duplicate_actual_rows,
    })
}

/// Writes the rule's status column from whether the presence column is non-null.
pub fn derive_status(table: &Table, rule: &StatusRule) -> Result<Table, ReconError> {
    column_in(table, "reconciled", &rule.presence_column)?;
    let values = table
        .column_values(&rule.presence_column)?
        .into_iter()
        .map(|present| {
            Some(if present.is_some() {
                rule.matched.clone()
            } else {
                rule.unmatched.clone()
            })
        })
        .collect();
    Ok(table.with_column(&rule.status_column, values)?)
}

/// Forces `SCORE` to 100 wherever `TOTAL_SAMPLE` is zero, null, non-numeric or absent.
pub fn apply_score_floor(table: &Table) -> Result<Table, ReconError> {
    let totals = table.column_values(TOTAL_SAMPLE).ok();
    let scores = table.column_values(SCORE).ok();
    let values = (0..table.height())
        .map(|row| {
            let sampled = totals
                .as_ref()
                .and_then(|t| parse_numeric(t[row]))
                .is_some_and(|t| t != 0.0);
            if sampled {
                scores.as_ref().and_then(|s| s[row].map(str::to_string))
            } else {
                Some(FULL_SCORE.to_string())
            }
        })
        .collect();
    Ok(table.with_column(SCORE, values)?)
}

/// Collapses an already-split column pair into `target`, at `primary`'s position.
pub fn coalesce_columns(
    table: &Table,
    primary: &str,
    fallback: &str,
    target: &str,
    preference: Preference,
) -> Result<Table, ReconError> {
    column_in(table, "coalesce", primary)?;
    column_in(table, "coalesce", fallback)?;
    let values = table
        .column_values(primary)?
        .into_iter()
        .zip(table.column_values(fallback)?)
        .map(|(p, f)| preference.resolve(p, f))
        .collect();
    let mut out = table.with_column(primary, values)?;
    if fallback != primary {
        out = out.drop_columns(&[fallback]);
    }
    if target != primary {
        out = out.rename_column(primary, target)?;
    }
    Ok(out)
}

/// Adds `CI_CODE` derived from the `COMPLIANCE_INDICATOR` text.
pub fn with_compliance_codes(table: &Table, input: &str) -> Result<Table, ReconError> {
    column_in(table, input, COMPLIANCE_INDICATOR)?;
    let codes = table
        .column_values(COMPLIANCE_INDICATOR)?
        .into_iter()
        .map(compliance_code)
        .collect();
    Ok(table.with_column(CI_CODE, codes)?)
}

/// Branch × LOB catalog reconciled against user setups.
pub fn reconcile_setup(
    branches: &Table,
    setups: &Table,
    duplicate_keys: DuplicateKeyPolicy,
) -> Result<Reconciled, ReconError> {
    column_in(branches, "branches", BRANCH_ID)?;
    columns_in(setups, "setups", &[BRANCH_ID, LOB, EMPLOYEE_ID])?;
    let expected = expand_catalog(branches, LOB, &LOB_CATALOG)?;
    let options = ReconcileOptions::default()
        .with_duplicate_keys(duplicate_keys)
        .with_status(StatusRule::setup());
    reconcile(&expected, setups, &SETUP_JOIN_KEYS, &options)
}

/// Branch × work-paper definitions reconciled against inspection progress.
pub fn reconcile_work_papers(
    branches: &Table,
    definitions: &Table,
    progress: &Table,
    duplicate_keys: DuplicateKeyPolicy,
) -> Result<Reconciled, ReconError> {
    column_in(branches, "branches", BRANCH_ID)?;
    columns_in(
        definitions,
        "work paper definitions",
        &[LOB, SUB_WP, PROCESS, COMPLIANCE_INDICATOR],
    )?;
    columns_in(
        progress,
        "progress",
        &[BRANCH_ID, LOB, SUB_WP, PROCESS, COMPLIANCE_INDICATOR],
    )?;

    let definitions = with_compliance_codes(definitions, "work paper definitions")?;
    let expected = cross_join(branches, &definitions)?;
    let actual = with_compliance_codes(progress, "progress")?;

    let options = DUPLICATE_PRONE_FIELDS.iter().fold(
        ReconcileOptions::default()
            .with_duplicate_keys(duplicate_keys)
            .with_score_floor(),
        |options, field| options.with_preference(field, Preference::ExpectedFirst),
    );
    reconcile(&expected, &actual, &WORK_PAPER_JOIN_KEYS, &options)
}

/// Target rows per top-level group: one number for every group, or a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quota {
    Uniform(usize),
    PerGroup(QuotaTable),
}

/// Per-group quotas with a fallback; unknown keys are rejected so typos fail loudly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaTable {
    #[serde(default)]
    pub default: usize,
    #[serde(default)]
    pub groups: BTreeMap<String, usize>,
}

impl Quota {
    pub fn for_group(&self, group: &str) -> usize {
        match self {
            Self::Uniform(n) => *n,
            Self::PerGroup(table) => table.groups.get(group).copied().unwrap_or(table.default),
        }
    }
}

/// Pool used by the redistribution pass of the two-level sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedistributionPolicy {
    /// Only rows not drawn in the main pass are eligible.
    #[default]
    ExcludeDrawn,
    /// The whole branch group is eligible again; rows may repeat.
    IndependentRedraw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralPlan {
    pub top_key: String,
    pub branch_key: String,
    pub extra_keys: Vec<String>,
    pub quota: Quota,
    pub redistribution: RedistributionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDraw {
    pub group: String,
    pub available: usize,
    pub drawn: usize,
}

#[derive(Debug, Clone)]
pub struct FixedSample {
    pub table: Table,
    pub groups: Vec<GroupDraw>,
    pub unassigned_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopGroupDraw {
    pub group: String,
    pub quota: usize,
    pub branch_count: usize,
    pub per_branch_share: usize,
    pub drawn_main: usize,
    pub drawn_redistributed: usize,
    pub remaining: i64,
}

#[derive(Debug, Clone)]
pub struct CentralSample {
    pub table: Table,
    pub groups: Vec<TopGroupDraw>,
    pub unassigned_rows: usize,
}

type Groups = BTreeMap<Vec<String>, Vec<usize>>;

/// Groups `rows` by the values at `keys`, ascending. Rows with a null key are counted, not grouped.
fn partition(table: &Table, keys: &[&str], rows: &[usize]) -> Result<(Groups, usize), ReconError> {
    let subset = table.select_rows(rows)?;
    let mut groups = Groups::new();
    let mut unassigned = 0usize;
    for (key, members) in subset.group_rows(keys)? {
        let members: Vec<usize> = members.into_iter().map(|i| rows[i]).collect();
        match key.into_iter().collect::<Option<Vec<String>>>() {
            Some(key) => {
                groups.insert(key, members);
            }
            None => unassigned += members.len(),
        }
    }
    Ok((groups, unassigned))
}

/// Seeded uniform sampling without replacement within groups.
///
/// Every draw starts from a generator freshly seeded with `seed`, so a group's
/// sample depends only on its own rows and their order.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSampler {
    seed: u64,
}

impl Default for QuotaSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SEED)
    }
}

impl QuotaSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn draw(&self, pool: &[usize], amount: usize) -> Vec<usize> {
        let amount = amount.min(pool.len());
        if amount == 0 {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        rand::seq::index::sample(&mut rng, pool.len(), amount)
            .into_vec()
            .into_iter()
            .map(|i| pool[i])
            .collect()
    }

    /// Draws `min(cap, |group|)` rows from every group of `group_key`.
    pub fn sample_per_group(
        &self,
        table: &Table,
        group_key: &str,
        cap: usize,
    ) -> Result<FixedSample, ReconError> {
        column_in(table, "sample input", group_key)?;
        let all = (0..table.height()).collect::<Vec<_>>();
        let (groups, unassigned_rows) = partition(table, &[group_key], &all)?;
        if unassigned_rows > 0 {
            debug!(unassigned_rows, group_key, "rows without a group value are not sampled");
        }

        let mut picked = Vec::new();
        let mut draws = Vec::with_capacity(groups.len());
        for (group, members) in &groups {
            let rows = self.draw(members, cap);
            draws.push(GroupDraw {
                group: group.join(" | "),
                available: members.len(),
                drawn: rows.len(),
            });
            picked.extend(rows);
        }

        Ok(FixedSample {
            table: table.select_rows(&picked)?,
            groups: draws,
            unassigned_rows,
        })
    }

    /// Two-level quota sampling with redistribution of unused quota.
    ///
    /// Per top group: `share = max(1, quota / branches)` rows per branch (per
    /// sub-group when extra keys are set), then any quota left over is handed
    /// to branches with more than `share` rows, in branch order.
    pub fn sample_central(
        &self,
        table: &Table,
        plan: &CentralPlan,
    ) -> Result<CentralSample, ReconError> {
        column_in(table, "sample input", &plan.top_key)?;
        column_in(table, "sample input", &plan.branch_key)?;
        let extra: Vec<&str> = plan.extra_keys.iter().map(String::as_str).collect();
        columns_in(table, "sample input", &extra)?;

        let all = (0..table.height()).collect::<Vec<_>>();
        let (top_groups, mut unassigned_rows) = partition(table, &[plan.top_key.as_str()], &all)?;

        let mut picked = Vec::new();
        let mut stats = Vec::with_capacity(top_groups.len());
        for (top_key, members) in &top_groups {
            let group = top_key.join(" | ");
            let quota = plan.quota.for_group(&group);
            let (branches, no_branch) = partition(table, &[plan.branch_key.as_str()], members)?;
            unassigned_rows += no_branch;

            if branches.is_empty() {
                debug!(group = %group, "top group has no branches; skipping");
                stats.push(TopGroupDraw {
                    group,
                    quota,
                    branch_count: 0,
                    per_branch_share: 0,
                    drawn_main: 0,
                    drawn_redistributed: 0,
                    remaining: quota as i64,
                });
                continue;
            }

            let share = (quota / branches.len()).max(1);
            let mut remaining = quota as i64;
            let mut drawn_main = 0usize;
            let mut first_pass = Vec::with_capacity(branches.len());
            for rows in branches.values() {
                let rows_drawn = if extra.is_empty() {
                    self.draw(rows, share)
                } else {
                    let (subgroups, no_sub) = partition(table, &extra, rows)?;
                    unassigned_rows += no_sub;
                    subgroups
                        .values()
                        .flat_map(|sub| self.draw(sub, share))
                        .collect()
                };
                remaining -= rows_drawn.len() as i64;
                drawn_main += rows_drawn.len();
                picked.extend(rows_drawn.iter().copied());
                first_pass.push(rows_drawn);
            }

            let mut drawn_redistributed = 0usize;
            if remaining > 0 {
                for (rows, already) in branches.values().zip(&first_pass) {
                    if remaining <= 0 {
                        break;
                    }
                    let spare = rows.len().saturating_sub(share);
                    let pool = match plan.redistribution {
                        RedistributionPolicy::ExcludeDrawn => {
                            let taken: HashSet<usize> = already.iter().copied().collect();
                            rows.iter()
                                .copied()
                                .filter(|r| !taken.contains(r))
                                .collect::<Vec<_>>()
                        }
                        RedistributionPolicy::IndependentRedraw => rows.clone(),
                    };
                    let extra_rows = (remaining as usize).min(spare).min(pool.len());
                    if extra_rows == 0 {
                        continue;
                    }
                    let rows_drawn = self.draw(&pool, extra_rows);
                    remaining -= rows_drawn.len() as i64;
                    drawn_redistributed += rows_drawn.len();
                    picked.extend(rows_drawn);
                }
            }

            stats.push(TopGroupDraw {
                group,
                quota,
                branch_count: branches.len(),
                per_branch_share: share,
                drawn_main,
                drawn_redistributed,
                remaining,
            });
        }

        Ok(CentralSample {
            table: table.select_rows(&picked)?,
            groups: stats,
            unassigned_rows,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub pct_before: f64,
    pub pct_after: f64,
    pub delta: f64,
}

/// Completion rate of one breakdown group; `group` is `None` for rows with a null group value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRate {
    pub group: Option<String>,
    pub total: usize,
    pub matching: usize,
    pub pct: f64,
}

impl GroupRate {
    /// Display name, with null groups shown as [`UNASSIGNED_GROUP`].
    pub fn label(&self) -> &str {
        self.group.as_deref().unwrap_or(UNASSIGNED_GROUP)
    }
}

fn percentage(matching: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * matching as f64 / total as f64
    }
}

/// Share of rows (in percent) whose `status_field` equals `target_status`; 0 for an empty table.
pub fn status_rate(
    table: &Table,
    input: &str,
    status_field: &str,
    target_status: &str,
) -> Result<f64, ReconError> {
    column_in(table, input, status_field)?;
    let matching = table
        .column_values(status_field)?
        .into_iter()
        .filter(|s| *s == Some(target_status))
        .count();
    Ok(percentage(matching, table.height()))
}

pub fn compare(
    before: &Table,
    after: &Table,
    status_field: &str,
    target_status: &str,
) -> Result<Comparison, ReconError> {
    let pct_before = status_rate(before, "before", status_field, target_status)?;
    let pct_after = status_rate(after, "after", status_field, target_status)?;
    Ok(Comparison {
        pct_before,
        pct_after,
        delta: pct_after - pct_before,
    })
}

/// Per-group completion rate. The null group comes first, then groups ascending.
pub fn status_breakdown(
    table: &Table,
    group_field: &str,
    status_field: &str,
    target_status: &str,
) -> Result<Vec<GroupRate>, ReconError> {
    column_in(table, "breakdown input", group_field)?;
    column_in(table, "breakdown input", status_field)?;
    let groups = table.column_values(group_field)?;
    let statuses = table.column_values(status_field)?;
    let mut counts: BTreeMap<Option<&str>, (usize, usize)> = BTreeMap::new();
    for (group, status) in groups.into_iter().zip(statuses) {
        let entry = counts.entry(group).or_default();
        entry.0 += 1;
        if status == Some(target_status) {
            entry.1 += 1;
        }
    }
    Ok(counts
        .into_iter()
        .map(|(group, (total, matching))| GroupRate {
            group: group.map(str::to_string),
            total,
            matching,
            pct: percentage(matching, total),
        })
        .collect())
}
