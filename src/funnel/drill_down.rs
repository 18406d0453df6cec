//! Drill-Down State
//!
//! Pure computation of where a drill-down session stands: depth, branch
//! path, backtrack and impasse detection, whether finalizing is allowed,
//! and the single instruction the oracle receives for the next turn.

use serde::{Deserialize, Serialize};

use crate::oracle::Phase;
use crate::themes;

/// Consecutive "neither" answers that trigger a backtrack.
pub const NEITHER_STREAK: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    A,
    B,
    Neither,
}

/// One answered oracle-backed question. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillDownNode {
    pub question: String,
    pub option_a: String,
    pub option_b: String,
    pub choice: Choice,
    /// Every label of the pool when "neither" rejected the whole of it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl DrillDownNode {
    pub fn chosen_label(&self) -> Option<&str> {
        match self.choice {
            Choice::A => Some(&self.option_a),
            Choice::B => Some(&self.option_b),
            Choice::Neither => None,
        }
    }

    /// Labels turned down by a "neither" answer.
    pub fn rejected_labels(&self) -> Vec<String> {
        if !self.rejected.is_empty() {
            return self.rejected.clone();
        }
        [&self.option_a, &self.option_b]
            .into_iter()
            .filter(|label| !label.is_empty())
            .cloned()
            .collect()
    }
}

/// Availability signal from a location scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScarcityFlags {
    pub availability_count: usize,
    pub radius_maxed: bool,
    pub home_mode_tried: bool,
}

impl ScarcityFlags {
    /// 0 fine, 1 widen the radius, 2 switch to at-home mode, 3 best-effort guess.
    pub fn fallback_level(&self) -> u8 {
        match (self.availability_count, self.radius_maxed, self.home_mode_tried) {
            (n, _, _) if n > 0 => 0,
            (_, _, true) => 3,
            (_, true, false) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrillDownInput<'a> {
    pub theme_slug: &'a str,
    pub is_home: bool,
    /// Every answered node, the current one last.
    pub history: &'a [DrillDownNode],
    pub choice: Option<Choice>,
    pub min_depth: u32,
    pub max_depth: u32,
    pub consecutive_neithers: Option<u32>,
    pub scarcity: Option<ScarcityFlags>,
    pub force_finalize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    Finalize,
    Impasse,
    Backtrack { parent: String },
    RejectedPool { labels: Vec<String> },
    FirstQuestion,
    MaxDepth,
    SubdivideOrFinalize { chosen: String },
    Subdivide { chosen: String },
}

impl Instruction {
    /// Whether the oracle may answer this instruction with a final recommendation.
    pub fn allows_finalize(&self) -> bool {
        matches!(
            self,
            Instruction::Finalize | Instruction::Impasse | Instruction::MaxDepth | Instruction::SubdivideOrFinalize { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillDownState {
    pub depth: u32,
    pub branch_path: Vec<String>,
    pub may_finalize: bool,
    pub consecutive_neithers: u32,
    pub should_backtrack: bool,
    pub is_impasse: bool,
    pub fallback_level: Option<u8>,
    pub phase: Phase,
    pub is_home: bool,
    pub instruction: Instruction,
}

impl DrillDownState {
    pub fn current_branch(&self) -> &str {
        self.branch_path.last().map(String::as_str).unwrap_or_default()
    }
}

pub fn build(input: &DrillDownInput<'_>) -> DrillDownState {
    let root = themes::by_slug(input.theme_slug)
        .map(|t| t.name.to_string())
        .unwrap_or_else(|| input.theme_slug.to_string());

    let derived_trailing = input
        .history
        .iter()
        .rev()
        .take_while(|n| n.choice == Choice::Neither)
        .count();
    let settled = &input.history[..input.history.len() - derived_trailing];

    let mut levels: Vec<String> = Vec::new();
    let mut streak = 0u32;
    for node in settled {
        match node.chosen_label() {
            Some(label) => {
                levels.push(label.to_string());
                streak = 0;
            }
            None => {
                streak += 1;
                if streak % NEITHER_STREAK == 0 {
                    levels.pop();
                }
            }
        }
    }

    // the trailing streak is replayed with the override when one is given
    let trailing = input.consecutive_neithers.unwrap_or(derived_trailing as u32);
    let mut last_backtrack_had_parent = true;
    for n in 1..=trailing {
        if n % NEITHER_STREAK == 0 {
            last_backtrack_had_parent = levels.pop().is_some();
        }
    }
    let should_backtrack = trailing > 0 && trailing % NEITHER_STREAK == 0;
    let is_impasse = should_backtrack && !last_backtrack_had_parent;

    let depth = 1 + levels.len() as u32;
    let mut branch_path = Vec::with_capacity(levels.len() + 1);
    branch_path.push(root);
    branch_path.extend(levels);

    let picked = matches!(input.choice, Some(Choice::A) | Some(Choice::B));
    let may_finalize = input.force_finalize || (picked && depth >= input.min_depth);
    let fallback_level = input.scarcity.map(|s| s.fallback_level());

    let last = input.history.last();
    let instruction = if input.force_finalize {
        Instruction::Finalize
    } else if is_impasse {
        Instruction::Impasse
    } else if should_backtrack {
        Instruction::Backtrack { parent: branch_path.last().cloned().unwrap_or_default() }
    } else if input.choice == Some(Choice::Neither) {
        Instruction::RejectedPool { labels: last.map(DrillDownNode::rejected_labels).unwrap_or_default() }
    } else if input.choice.is_none() {
        Instruction::FirstQuestion
    } else if depth >= input.max_depth {
        Instruction::MaxDepth
    } else {
        let chosen = last.and_then(|n| n.chosen_label()).unwrap_or_default().to_string();
        if may_finalize {
            Instruction::SubdivideOrFinalize { chosen }
        } else {
            Instruction::Subdivide { chosen }
        }
    };

    let phase = match instruction {
        Instruction::Finalize | Instruction::MaxDepth => Phase::Resultat,
        Instruction::Impasse => Phase::Breakout,
        Instruction::Backtrack { .. } | Instruction::RejectedPool { .. } => Phase::Pivot,
        _ => Phase::Questionnement,
    };

    DrillDownState {
        depth,
        branch_path,
        may_finalize,
        consecutive_neithers: trailing,
        should_backtrack,
        is_impasse,
        fallback_level,
        phase,
        is_home: input.is_home,
        instruction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(a: &str, b: &str, choice: Choice) -> DrillDownNode {
        DrillDownNode { question: "?".into(), option_a: a.into(), option_b: b.into(), choice, rejected: Vec::new() }
    }

    fn input<'a>(history: &'a [DrillDownNode]) -> DrillDownInput<'a> {
        DrillDownInput {
            theme_slug: "jeux",
            is_home: true,
            history,
            choice: history.last().map(|n| n.choice),
            min_depth: 3,
            max_depth: 8,
            consecutive_neithers: None,
            scarcity: None,
            force_finalize: false,
        }
    }

    #[test]
    fn test_first_call() {
        let state = build(&input(&[]));
        assert_eq!(state.depth, 1);
        assert_eq!(state.branch_path, vec!["Jeux"]);
        assert_eq!(state.instruction, Instruction::FirstQuestion);
        assert!(!state.may_finalize);
        assert_eq!(state.fallback_level, None);
    }

    #[test]
    fn test_neither_is_transparent_to_depth() {
        let history = vec![
            node("Société", "Vidéo", Choice::A),
            node("Coop", "Compét", Choice::Neither),
            node("Cartes", "Plateau", Choice::B),
            node("Court", "Long", Choice::Neither),
            node("Deux", "Quatre", Choice::A),
        ];
        let state = build(&input(&history));
        assert_eq!(state.depth, 4);
        assert_eq!(state.branch_path, vec!["Jeux", "Société", "Plateau", "Deux"]);
        assert_eq!(state.branch_path.len() as u32, state.depth);
        assert!(state.may_finalize);
        assert_eq!(state.instruction, Instruction::SubdivideOrFinalize { chosen: "Deux".into() });
    }

    #[test]
    fn test_subdivide_below_min_depth() {
        let history = vec![node("Société", "Vidéo", Choice::B)];
        let state = build(&input(&history));
        assert_eq!(state.depth, 2);
        assert!(!state.may_finalize);
        assert_eq!(state.instruction, Instruction::Subdivide { chosen: "Vidéo".into() });
        assert!(!state.instruction.allows_finalize());
    }

    #[test]
    fn test_single_neither_rejects_pool() {
        let history = vec![node("Société", "Vidéo", Choice::A), node("x", "y", Choice::Neither)];
        let state = build(&input(&history));
        assert_eq!(state.depth, 2);
        assert_eq!(state.phase, Phase::Pivot);
        assert_eq!(
            state.instruction,
            Instruction::RejectedPool { labels: vec!["x".into(), "y".into()] }
        );
    }

    #[test]
    fn test_rejected_pool_names_every_label() {
        let mut last = node("Quiz", "", Choice::Neither);
        last.rejected = vec!["Société".into(), "Vidéo".into(), "Quiz".into()];
        let history = vec![node("Jeux", "Sport", Choice::A), last];
        let state = build(&input(&history));
        assert_eq!(
            state.instruction,
            Instruction::RejectedPool { labels: vec!["Société".into(), "Vidéo".into(), "Quiz".into()] }
        );
    }

    #[test]
    fn test_third_neither_backtracks_one_level() {
        let history = vec![
            node("Société", "Vidéo", Choice::A),
            node("Cartes", "Plateau", Choice::B),
            node("a", "b", Choice::Neither),
            node("c", "d", Choice::Neither),
            node("e", "f", Choice::Neither),
        ];
        let state = build(&input(&history));
        assert!(state.should_backtrack);
        assert!(!state.is_impasse);
        assert_eq!(state.depth, 2);
        assert_eq!(state.instruction, Instruction::Backtrack { parent: "Société".into() });
    }

    #[test]
    fn test_backtrack_without_parent_is_impasse() {
        let history = vec![
            node("a", "b", Choice::Neither),
            node("c", "d", Choice::Neither),
            node("e", "f", Choice::Neither),
        ];
        let state = build(&input(&history));
        assert!(state.is_impasse);
        assert_eq!(state.phase, Phase::Breakout);
        assert_eq!(state.instruction, Instruction::Impasse);
        assert!(state.instruction.allows_finalize());
    }

    #[test]
    fn test_neither_override() {
        let history = vec![node("Société", "Vidéo", Choice::A), node("a", "b", Choice::Neither)];
        let mut i = input(&history);
        i.consecutive_neithers = Some(3);
        let state = build(&i);
        assert!(state.should_backtrack);
        assert!(!state.is_impasse);
    }

    #[test]
    fn test_matching_override_gives_same_state() {
        let history = vec![
            node("Société", "Vidéo", Choice::A),
            node("a", "b", Choice::Neither),
            node("c", "d", Choice::Neither),
            node("e", "f", Choice::Neither),
        ];
        let derived = build(&input(&history));
        let mut i = input(&history);
        i.consecutive_neithers = Some(3);
        let supplied = build(&i);

        assert_eq!(derived, supplied);
        assert!(!supplied.is_impasse);
        assert_eq!(supplied.instruction, Instruction::Backtrack { parent: "Jeux".into() });

        // a second streak with no level left is an impasse either way
        let mut deeper = history.clone();
        deeper.extend([
            node("g", "h", Choice::Neither),
            node("i", "j", Choice::Neither),
            node("k", "l", Choice::Neither),
        ]);
        let derived = build(&input(&deeper));
        let mut i = input(&deeper);
        i.consecutive_neithers = Some(6);
        assert!(derived.is_impasse);
        assert_eq!(derived, build(&i));
    }

    #[test]
    fn test_force_finalize_wins() {
        let history = vec![
            node("a", "b", Choice::Neither),
            node("c", "d", Choice::Neither),
            node("e", "f", Choice::Neither),
        ];
        let mut i = input(&history);
        i.force_finalize = true;
        let state = build(&i);
        assert!(state.may_finalize);
        assert_eq!(state.instruction, Instruction::Finalize);
    }

    #[test]
    fn test_max_depth() {
        let history: Vec<_> = (0..3).map(|i| node(&format!("a{}", i), "b", Choice::A)).collect();
        let mut i = input(&history);
        i.max_depth = 4;
        let state = build(&i);
        assert_eq!(state.depth, 4);
        assert_eq!(state.instruction, Instruction::MaxDepth);
    }

    #[test]
    fn test_fallback_ladder() {
        let flags = |count, maxed, home| ScarcityFlags {
            availability_count: count,
            radius_maxed: maxed,
            home_mode_tried: home,
        };
        assert_eq!(flags(4, false, false).fallback_level(), 0);
        assert_eq!(flags(0, false, false).fallback_level(), 1);
        assert_eq!(flags(0, true, false).fallback_level(), 2);
        assert_eq!(flags(0, true, true).fallback_level(), 3);

        let mut i = input(&[]);
        i.scarcity = Some(flags(0, true, false));
        assert_eq!(build(&i).fallback_level, Some(2));
    }
}
