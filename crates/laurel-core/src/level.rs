//! Level table and calculator.
//!
//! The table is a static, ordered set of cumulative XP thresholds. The
//! calculator is a pure function from total XP to (level, threshold,
//! xp-to-next): total for every non-negative input and monotonic
//! non-decreasing, so it is safe to call anywhere, including outside a
//! transaction.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Definitions ─────────────────────────────────────────────────────────────

/// One row of the level table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDefinition {
  pub level:       u32,
  /// Cumulative XP required to reach this level.
  pub xp_required: i64,
  /// Delta to the following level; `None` for the final level.
  pub xp_for_next: Option<i64>,
}

/// Result of [`LevelTable::level_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
  pub level:        u32,
  /// Cumulative XP required to reach `level`.
  pub xp_threshold: i64,
  /// XP still missing to reach the next level; 0 at the max level.
  pub xp_to_next:   i64,
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// Validated, ascending level table.
#[derive(Debug, Clone)]
pub struct LevelTable {
  defs: Vec<LevelDefinition>,
}

impl LevelTable {
  /// Build a table from definitions sorted ascending by `xp_required`.
  ///
  /// The first level must require 0 XP so the calculator is total over all
  /// non-negative balances. Levels and thresholds must be strictly
  /// increasing, and any `xp_for_next` must agree with the next threshold.
  pub fn new(defs: Vec<LevelDefinition>) -> Result<Self> {
    if defs.is_empty() {
      return Err(Error::InvalidLevelTable("table is empty".into()));
    }
    if defs[0].xp_required != 0 {
      return Err(Error::InvalidLevelTable(
        "first level must require 0 XP".into(),
      ));
    }
    for pair in defs.windows(2) {
      if pair[1].level <= pair[0].level {
        return Err(Error::InvalidLevelTable(format!(
          "levels must be strictly increasing (level {} follows {})",
          pair[1].level, pair[0].level
        )));
      }
      if pair[1].xp_required <= pair[0].xp_required {
        return Err(Error::InvalidLevelTable(format!(
          "thresholds must be strictly increasing (level {} requires {})",
          pair[1].level, pair[1].xp_required
        )));
      }
      if let Some(next) = pair[0].xp_for_next
        && next != pair[1].xp_required - pair[0].xp_required
      {
        return Err(Error::InvalidLevelTable(format!(
          "xp_for_next of level {} disagrees with the following threshold",
          pair[0].level
        )));
      }
    }
    if let Some(last) = defs.last()
      && last.xp_for_next.is_some()
    {
      return Err(Error::InvalidLevelTable(
        "final level must not declare xp_for_next".into(),
      ));
    }
    Ok(Self { defs })
  }

  /// The default ten-level curve shipped with the engine.
  pub fn builtin() -> Self {
    // Known-good by construction; thresholds strictly ascend from 0.
    let thresholds: [i64; 10] =
      [0, 100, 250, 450, 700, 1000, 1400, 1900, 2500, 3200];
    let defs = thresholds
      .iter()
      .enumerate()
      .map(|(i, &xp_required)| LevelDefinition {
        level: i as u32 + 1,
        xp_required,
        xp_for_next: thresholds.get(i + 1).map(|next| next - xp_required),
      })
      .collect();
    Self { defs }
  }

  pub fn levels(&self) -> &[LevelDefinition] { &self.defs }

  pub fn max_level(&self) -> u32 {
    self.defs.last().map(|d| d.level).unwrap_or(0)
  }

  /// Pure calculator: the largest level whose threshold does not exceed
  /// `xp_total`. Inputs below 0 clamp to the first level.
  pub fn level_info(&self, xp_total: i64) -> LevelInfo {
    let xp = xp_total.max(0);

    let mut idx = 0;
    for (i, def) in self.defs.iter().enumerate() {
      if def.xp_required <= xp {
        idx = i;
      } else {
        break;
      }
    }

    let current = &self.defs[idx];
    let xp_to_next = match self.defs.get(idx + 1) {
      Some(next) => next.xp_required - xp,
      None => 0,
    };

    LevelInfo {
      level:        current.level,
      xp_threshold: current.xp_required,
      xp_to_next,
    }
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  fn small_table() -> LevelTable {
    LevelTable::new(vec![
      LevelDefinition { level: 1, xp_required: 0, xp_for_next: Some(100) },
      LevelDefinition { level: 2, xp_required: 100, xp_for_next: Some(150) },
      LevelDefinition { level: 3, xp_required: 250, xp_for_next: None },
    ])
    .unwrap()
  }

  #[test]
  fn thresholds_and_to_next() {
    let t = small_table();

    let at_80 = t.level_info(80);
    assert_eq!(at_80.level, 1);
    assert_eq!(at_80.xp_threshold, 0);
    assert_eq!(at_80.xp_to_next, 20);

    let at_110 = t.level_info(110);
    assert_eq!(at_110.level, 2);
    assert_eq!(at_110.xp_threshold, 100);
    assert_eq!(at_110.xp_to_next, 140);

    // Exactly at a boundary belongs to the higher level.
    assert_eq!(t.level_info(100).level, 2);
    assert_eq!(t.level_info(250).level, 3);
  }

  #[test]
  fn max_level_has_zero_to_next() {
    let t = small_table();
    let top = t.level_info(10_000);
    assert_eq!(top.level, 3);
    assert_eq!(top.xp_to_next, 0);
  }

  #[test]
  fn total_and_monotonic() {
    let t = LevelTable::builtin();
    let mut last = 0;
    for xp in 0..4000 {
      let level = t.level_info(xp).level;
      assert!(level >= last, "level decreased at xp={xp}");
      last = level;
    }
  }

  #[test]
  fn negative_input_clamps_to_first_level() {
    let t = small_table();
    assert_eq!(t.level_info(-5).level, 1);
    assert_eq!(t.level_info(-5).xp_to_next, 100);
  }

  #[test]
  fn rejects_empty_table() {
    assert!(matches!(
      LevelTable::new(vec![]),
      Err(Error::InvalidLevelTable(_))
    ));
  }

  #[test]
  fn rejects_nonzero_first_threshold() {
    let result = LevelTable::new(vec![LevelDefinition {
      level:       1,
      xp_required: 50,
      xp_for_next: None,
    }]);
    assert!(matches!(result, Err(Error::InvalidLevelTable(_))));
  }

  #[test]
  fn rejects_non_increasing_thresholds() {
    let result = LevelTable::new(vec![
      LevelDefinition { level: 1, xp_required: 0, xp_for_next: None },
      LevelDefinition { level: 2, xp_required: 0, xp_for_next: None },
    ]);
    assert!(matches!(result, Err(Error::InvalidLevelTable(_))));
  }

  #[test]
  fn rejects_inconsistent_xp_for_next() {
    let result = LevelTable::new(vec![
      LevelDefinition { level: 1, xp_required: 0, xp_for_next: Some(99) },
      LevelDefinition { level: 2, xp_required: 100, xp_for_next: None },
    ]);
    assert!(matches!(result, Err(Error::InvalidLevelTable(_))));
  }

  #[test]
  fn builtin_is_valid() {
    let t = LevelTable::builtin();
    assert!(LevelTable::new(t.levels().to_vec()).is_ok());
    assert_eq!(t.max_level(), 10);
  }
}
