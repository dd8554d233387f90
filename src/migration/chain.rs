//! Linear migration chain built from predecessor links

use crate::migration::{MigrationError, MigrationScript};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Where `apply` should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The newest script in the chain
    Head,
    /// A specific script version (inclusive)
    Version(i64),
}

impl FromStr for Target {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("head") {
            return Ok(Target::Head);
        }
        s.parse::<i64>()
            .map(Target::Version)
            .map_err(|_| MigrationError::UnknownTarget(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Head => write!(f, "head"),
            Target::Version(v) => write!(f, "{v}"),
        }
    }
}

/// Where `downgrade` should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeTarget {
    /// Revert every applied script
    Base,
    /// Revert down to this version (exclusive; it stays applied)
    Version(i64),
}

impl FromStr for DowngradeTarget {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("base") {
            return Ok(DowngradeTarget::Base);
        }
        s.parse::<i64>()
            .map(DowngradeTarget::Version)
            .map_err(|_| MigrationError::UnknownTarget(s.to_string()))
    }
}

impl fmt::Display for DowngradeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradeTarget::Base => write!(f, "base"),
            DowngradeTarget::Version(v) => write!(f, "{v}"),
        }
    }
}

/// Scripts ordered by traversal from the root
///
/// Building the chain enforces the linear-history rules: one root, no two scripts
/// claiming the same predecessor, no dangling predecessors, nothing unreachable.
#[derive(Debug, Clone, Default)]
pub struct MigrationChain {
    scripts: Vec<MigrationScript>,
    index: HashMap<i64, usize>,
}

impl MigrationChain {
    /// Link `scripts` into a chain
    ///
    /// # Errors
    ///
    /// - `DuplicateVersion` if two scripts share a version
    /// - `AmbiguousChain` if there are several roots or two scripts follow the same predecessor
    /// - `BrokenChain` if there is no root, a predecessor is missing, or scripts form a cycle
    pub fn build(scripts: Vec<MigrationScript>) -> Result<Self, MigrationError> {
        if scripts.is_empty() {
            return Ok(Self::default());
        }

        let total = scripts.len();
        let mut by_version: HashMap<i64, MigrationScript> = HashMap::with_capacity(total);
        // BTreeMap keeps error reporting deterministic
        let mut successors: BTreeMap<Option<i64>, Vec<i64>> = BTreeMap::new();

        for script in scripts {
            let version = script.version;
            successors.entry(script.predecessor).or_default().push(version);
            if by_version.insert(version, script).is_some() {
                return Err(MigrationError::DuplicateVersion(version));
            }
        }

        for (predecessor, claimants) in &mut successors {
            if claimants.len() > 1 {
                claimants.sort_unstable();
                return Err(MigrationError::AmbiguousChain {
                    predecessor: *predecessor,
                    claimants: claimants.clone(),
                });
            }
        }

        for (predecessor, claimants) in &successors {
            if let Some(p) = predecessor {
                if !by_version.contains_key(p) {
                    return Err(MigrationError::BrokenChain(format!(
                        "script {} follows {p}, which does not exist",
                        claimants[0]
                    )));
                }
            }
        }

        let root = successors
            .get(&None)
            .and_then(|roots| roots.first().copied())
            .ok_or_else(|| {
                MigrationError::BrokenChain(
                    "no root script (every script names a predecessor)".to_string(),
                )
            })?;

        let mut ordered = Vec::with_capacity(total);
        let mut current = Some(root);
        while let Some(version) = current {
            let Some(script) = by_version.remove(&version) else {
                break;
            };
            ordered.push(script);
            current = successors
                .get(&Some(version))
                .and_then(|next| next.first().copied());
        }

        if ordered.len() != total {
            let mut orphans: Vec<i64> = by_version.into_keys().collect();
            orphans.sort_unstable();
            return Err(MigrationError::BrokenChain(format!(
                "scripts {orphans:?} are not reachable from root {root} (cycle in predecessor links)"
            )));
        }

        let index = ordered
            .iter()
            .enumerate()
            .map(|(i, s)| (s.version, i))
            .collect();

        Ok(Self {
            scripts: ordered,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// First script (no predecessor)
    pub fn root(&self) -> Option<&MigrationScript> {
        self.scripts.first()
    }

    /// Newest script
    pub fn tip(&self) -> Option<&MigrationScript> {
        self.scripts.last()
    }

    pub fn tip_version(&self) -> Option<i64> {
        self.tip().map(|s| s.version)
    }

    pub fn get(&self, version: i64) -> Option<&MigrationScript> {
        self.position(version).map(|i| &self.scripts[i])
    }

    /// Index of `version` in chain order
    pub fn position(&self, version: i64) -> Option<usize> {
        self.index.get(&version).copied()
    }

    pub fn contains(&self, version: i64) -> bool {
        self.index.contains_key(&version)
    }

    /// Scripts in chain order, root first
    pub fn iter(&self) -> impl Iterator<Item = &MigrationScript> {
        self.scripts.iter()
    }

    /// Fail with `UnknownTarget` unless `target` resolves in this chain
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::UnknownTarget` for a version that is not in the chain.
    pub fn validate_target(&self, target: &Target) -> Result<(), MigrationError> {
        match target {
            Target::Head => Ok(()),
            Target::Version(v) if self.contains(*v) => Ok(()),
            Target::Version(v) => Err(MigrationError::UnknownTarget(v.to_string())),
        }
    }

    /// Scripts after `head` (exclusive) up to `target` (inclusive), in chain order
    ///
    /// A target at or behind the head yields an empty set.
    ///
    /// # Errors
    ///
    /// - `UnknownTarget` if the target version is not in the chain
    /// - `UnknownHead` if the applied head is not in the chain
    pub fn pending(
        &self,
        head: Option<i64>,
        target: &Target,
    ) -> Result<Vec<&MigrationScript>, MigrationError> {
        self.validate_target(target)?;

        let start = match head {
            None => 0,
            Some(h) => self.position(h).ok_or(MigrationError::UnknownHead(h))? + 1,
        };
        let end = match target {
            Target::Head => self.scripts.len(),
            Target::Version(v) => self.position(*v).map_or(0, |i| i + 1),
        };

        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self.scripts[start..end].iter().collect())
    }

    /// Scripts to revert to move from `head` back to `target`, newest first
    ///
    /// # Errors
    ///
    /// - `UnknownTarget` if the target version is not in the chain
    /// - `UnknownHead` if the applied head is not in the chain
    pub fn rollback_path(
        &self,
        head: Option<i64>,
        target: &DowngradeTarget,
    ) -> Result<Vec<&MigrationScript>, MigrationError> {
        let stop = match target {
            DowngradeTarget::Base => 0,
            DowngradeTarget::Version(v) => {
                self.position(*v)
                    .ok_or_else(|| MigrationError::UnknownTarget(v.to_string()))?
                    + 1
            }
        };

        let Some(h) = head else {
            return Ok(Vec::new());
        };
        let head_pos = self.position(h).ok_or(MigrationError::UnknownHead(h))?;

        if stop > head_pos {
            return Ok(Vec::new());
        }
        Ok(self.scripts[stop..=head_pos].iter().rev().collect())
    }
}
