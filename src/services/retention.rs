use crate::config::Config;
use crate::entities::users::permissions;

/// Allowed expiry ages (hours, 0 = permanent) per permission group, with
/// inheritance: a group sees the union of its own list and every list below
/// its rank, deduplicated and sorted. The default age is the group's own
/// first entry or, when its list is empty, the nearest lower group's first.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// `(rank, ages)` sorted ascending by rank.
    groups: Vec<(i32, Vec<f64>)>,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            (permissions::USER, config.retention_user.clone()),
            (permissions::MODERATOR, config.retention_moderator.clone()),
            (permissions::ADMIN, config.retention_admin.clone()),
        ])
    }

    pub fn new(mut groups: Vec<(i32, Vec<f64>)>) -> Self {
        groups.sort_by_key(|(rank, _)| *rank);
        Self { groups }
    }

    /// All ages visible to a user of the given rank.
    pub fn periods_for(&self, rank: i32) -> Vec<f64> {
        let mut ages: Vec<f64> = self
            .groups
            .iter()
            .filter(|(group_rank, _)| *group_rank <= rank)
            .flat_map(|(_, ages)| ages.iter().copied())
            .collect();
        ages.sort_by(|a, b| a.total_cmp(b));
        ages.dedup();
        ages
    }

    /// The preselected age for the given rank.
    pub fn default_for(&self, rank: i32) -> Option<f64> {
        self.groups
            .iter()
            .rev()
            .filter(|(group_rank, _)| *group_rank <= rank)
            .find_map(|(_, ages)| ages.first().copied())
    }

    /// Whether a client-requested age is one this rank may use.
    pub fn is_allowed(&self, rank: i32, age: f64) -> bool {
        self.periods_for(rank).contains(&age)
    }

    /// Resolve the age an upload should get: a validated client request, the
    /// rank default otherwise. `Some(0.0)` and `None` both mean permanent.
    pub fn resolve(&self, rank: i32, requested: Option<f64>) -> Result<Option<f64>, f64> {
        match requested {
            Some(age) => {
                if self.is_allowed(rank, age) {
                    Ok(Some(age).filter(|a| *a > 0.0))
                } else {
                    Err(age)
                }
            }
            None => Ok(self.default_for(rank).filter(|a| *a > 0.0)),
        }
    }
}
