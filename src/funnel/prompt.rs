//! Oracle prompt assembly.
//!
//! The oracle sees a fixed system prompt, the user context, the previous
//! exchanges, and one directive derived from the drill-down state.

use serde::{Deserialize, Serialize};

use super::context::UserContext;
use super::drill_down::{DrillDownState, Instruction};
use crate::oracle::{ChatMessage, Recommendation};
use crate::places::OutdoorActivity;
use crate::themes::ThemeConfig;

/// One completed round trip: what we asked and what came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub directive: String,
    pub reply: String,
}

const SCHEMA: &str = r#"Reply with ONE JSON object and nothing else:
{
  "statut": "en_cours" | "finalisé" | "épuisé",
  "phase": "questionnement" | "pivot" | "breakout" | "resultat",
  "mogogo_message": "short friendly line, max 120 chars",
  "question": "max 100 chars",
  "subcategories": ["4 to 8 labels, max 40 chars each"],
  "options": {"A": "max 60 chars", "B": "max 60 chars"},
  "recommandation_finale": {"titre": "", "explication": "", "actions": [{"type": "maps|web|app", "label": "", "query": ""}], "tags": ["theme slug"]},
  "metadata": {"pivot_count": 0, "current_branch": "", "depth": 1}
}
Only include "recommandation_finale" when statut is "finalisé"."#;

pub fn system_prompt(theme: &ThemeConfig) -> String {
    format!(
        "You are Mogogo, a playful guide who helps people pick ONE leisure activity by asking \
         binary questions. The chosen theme is {} {} (slug \"{}\"). Never ask about constraints \
         already given in the context. Keep labels concrete and mutually exclusive.\n\n{}",
        theme.emoji, theme.name, theme.slug, SCHEMA
    )
}

pub fn context_message(context: &UserContext) -> String {
    format!("Context:\n{}", context.describe())
}

/// The single instruction for the next oracle turn.
pub fn directive(state: &DrillDownState) -> String {
    let path = state.branch_path.join(" > ");
    let mut text = match &state.instruction {
        Instruction::Finalize => format!(
            "Finalize now. Give your single best recommendation for the branch {}.",
            path
        ),
        Instruction::Impasse => {
            "The user rejected everything at the top level. Break out: propose a different angle on the \
             theme, or finalize with your best guess."
                .to_string()
        }
        Instruction::Backtrack { parent } => format!(
            "The user rejected three pools in a row. Go back up to \"{}\" and propose different \
             subcategories of it.",
            parent
        ),
        Instruction::RejectedPool { labels } => {
            let quoted: Vec<String> = labels.iter().map(|l| format!("\"{}\"", l)).collect();
            format!(
                "The user wants none of {}. Propose new subcategories at the same level of {}.",
                quoted.join(", "),
                path
            )
        }
        Instruction::FirstQuestion => {
            "Start: propose the first split of the theme as 4 to 8 subcategories.".to_string()
        }
        Instruction::MaxDepth => format!("Maximum depth reached. Finalize with the best match for {}.", path),
        Instruction::SubdivideOrFinalize { chosen } => format!(
            "The user chose \"{}\" (path {}). Either subdivide it further or, if it is specific enough, \
             finalize.",
            chosen, path
        ),
        Instruction::Subdivide { chosen } => format!(
            "The user chose \"{}\" (path {}). Subdivide it further. Do not finalize yet.",
            chosen, path
        ),
    };

    text.push_str(&format!("\n(depth {}, phase {:?})", state.depth, state.phase).to_lowercase());

    match state.fallback_level {
        Some(1) => text.push_str("\nFew places are available nearby; favour widely available activities."),
        Some(2) => text.push_str("\nNothing is available nearby: suggest activities to do at home."),
        Some(3) => text.push_str("\nNothing fits so far: give a best-effort guess if needed."),
        _ => {}
    }
    if state.is_home {
        text.push_str("\nThe activity must be doable at home.");
    }
    text
}

pub fn reroll_directive(current: &Recommendation) -> String {
    format!(
        "The user wants something else than \"{}\". Finalize with a different recommendation on the \
         same branch.",
        current.titre
    )
}

pub fn refine_directive(current: &Recommendation) -> String {
    format!(
        "The user likes \"{}\" but wants to refine it. Propose 4 to 8 subcategories of it. Do not \
         finalize yet.",
        current.titre
    )
}

/// Full message list for one oracle turn.
pub fn build_messages(
    theme: &ThemeConfig,
    context: &UserContext,
    exchanges: &[Exchange],
    directive: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(exchanges.len() * 2 + 3);
    messages.push(ChatMessage::system(system_prompt(theme)));
    messages.push(ChatMessage::user(context_message(context)));
    for exchange in exchanges {
        messages.push(ChatMessage::user(exchange.directive.clone()));
        messages.push(ChatMessage::assistant(exchange.reply.clone()));
    }
    messages.push(ChatMessage::user(directive.to_string()));
    messages
}

/// Ask the oracle to partition scanned places into binary duels.
pub fn dichotomy_messages(
    theme: &ThemeConfig,
    context: &UserContext,
    activities: &[OutdoorActivity],
) -> Vec<ChatMessage> {
    let listing: Vec<String> = activities
        .iter()
        .map(|a| {
            let rating = a.rating.map(|r| format!(" ★{:.1}", r)).unwrap_or_default();
            format!("{} | {} | {}{}", a.id, a.name, a.place_types.join(","), rating)
        })
        .collect();

    let system = format!(
        "You are Mogogo. The user picked {} {}. Split the places below with binary questions so the \
         user can narrow them down to 3 or fewer. Reply with ONE JSON object:\n\
         {{\"mogogo_message\": \"max 120 chars\", \"duels\": [{{\"question\": \"\", \"labelA\": \"\", \
         \"labelB\": \"\", \"idsA\": [\"id\"], \"idsB\": [\"id\"]}}]}}\n\
         Use only the ids listed. Order duels from broadest to finest.",
        theme.emoji, theme.name
    );

    vec![
        ChatMessage::system(system),
        ChatMessage::user(context_message(context)),
        ChatMessage::user(format!("Places (id | name | types | rating):\n{}", listing.join("\n"))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::drill_down::{build, DrillDownInput};
    use crate::funnel::context::{Budget, SocialGroup};
    use crate::oracle::Role;
    use crate::themes::{by_slug, Environment};

    fn context() -> UserContext {
        UserContext::new(SocialGroup::Friends, 4, Budget::Standard, Environment::Home)
    }

    #[test]
    fn test_build_messages_replays_exchanges() {
        let theme = by_slug("jeux").unwrap();
        let exchanges = vec![Exchange { directive: "start".into(), reply: "{\"statut\":\"en_cours\"}".into() }];
        let messages = build_messages(theme, &context(), &exchanges, "next");

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User, Role::Assistant, Role::User]);
        assert!(messages[0].content.contains("\"jeux\""));
        assert_eq!(messages.last().unwrap().content, "next");
    }

    #[test]
    fn test_directive_mentions_fallback_and_home() {
        let state = build(&DrillDownInput {
            theme_slug: "sport",
            is_home: true,
            history: &[],
            choice: None,
            min_depth: 3,
            max_depth: 8,
            consecutive_neithers: None,
            scarcity: Some(crate::funnel::ScarcityFlags {
                availability_count: 0,
                radius_maxed: true,
                home_mode_tried: false,
            }),
            force_finalize: false,
        });
        let text = directive(&state);
        assert!(text.starts_with("Start"));
        assert!(text.contains("at home"));
        assert!(text.contains("depth 1"));
    }
}
