//! Theme Catalog
//!
//! Static table of activity themes: which environments each theme is
//! eligible in and which place-search types represent it outdoors.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the user wants to spend the activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "env_home")]
    Home,
    #[serde(rename = "env_shelter")]
    Shelter,
    #[serde(rename = "env_open_air")]
    OpenAir,
}

impl Environment {
    /// Shelter and open-air sessions are narrowed over real nearby places.
    pub fn is_location_based(&self) -> bool {
        !matches!(self, Environment::Home)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Home => write!(f, "env_home"),
            Environment::Shelter => write!(f, "env_shelter"),
            Environment::OpenAir => write!(f, "env_open_air"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeConfig {
    pub slug: &'static str,
    pub name: &'static str,
    pub emoji: &'static str,
    pub environments: &'static [Environment],
    pub place_types: &'static [&'static str],
    pub tags: &'static [&'static str],
}

impl ThemeConfig {
    pub fn is_eligible(&self, environment: Environment) -> bool {
        self.environments.contains(&environment)
    }

    pub fn matches_place_types<S: AsRef<str>>(&self, types: &[S]) -> bool {
        types.iter().any(|t| self.place_types.contains(&t.as_ref()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("a duel needs at least two themes, got {0}")]
    PoolTooSmall(usize),
}

use Environment::{Home, OpenAir, Shelter};

static CATALOG: &[ThemeConfig] = &[
    ThemeConfig {
        slug: "sport",
        name: "Sport",
        emoji: "🏃",
        environments: &[Home, Shelter, OpenAir],
        place_types: &["gym", "fitness_center", "sports_complex", "swimming_pool", "bowling_alley"],
        tags: &["sport", "courir", "running", "velo", "foot", "piscine", "muscu"],
    },
    ThemeConfig {
        slug: "nature",
        name: "Nature",
        emoji: "🌿",
        environments: &[OpenAir],
        place_types: &["park", "national_park", "hiking_area", "botanical_garden", "garden"],
        tags: &["nature", "foret", "randonnee", "rando", "parc", "balade"],
    },
    ThemeConfig {
        slug: "culture",
        name: "Culture",
        emoji: "🏛️",
        environments: &[Home, Shelter],
        place_types: &["museum", "art_gallery", "cultural_center", "performing_arts_theater"],
        tags: &["culture", "musee", "expo", "exposition", "theatre", "art"],
    },
    ThemeConfig {
        slug: "gastronomie",
        name: "Gastronomie",
        emoji: "🍽️",
        environments: &[Home, Shelter],
        place_types: &["restaurant", "cafe", "bakery", "brunch_restaurant"],
        tags: &["gastronomie", "manger", "restaurant", "cuisine", "brunch", "diner"],
    },
    ThemeConfig {
        slug: "cinema",
        name: "Cinéma",
        emoji: "🎬",
        environments: &[Home, Shelter],
        place_types: &["movie_theater"],
        tags: &["cinema", "film", "films", "serie", "series"],
    },
    ThemeConfig {
        slug: "jeux",
        name: "Jeux",
        emoji: "🎲",
        environments: &[Home, Shelter],
        place_types: &["amusement_center", "video_arcade", "bowling_alley"],
        tags: &["jeux", "jeu", "societe", "arcade", "escape"],
    },
    ThemeConfig {
        slug: "fete",
        name: "Fête",
        emoji: "🎉",
        environments: &[Home, Shelter],
        place_types: &["night_club", "bar", "karaoke"],
        tags: &["fete", "soiree", "danser", "bar", "karaoke"],
    },
    ThemeConfig {
        slug: "musique",
        name: "Musique",
        emoji: "🎵",
        environments: &[Home, Shelter],
        place_types: &["concert_hall", "opera_house", "philharmonic_hall"],
        tags: &["musique", "concert", "chanter", "instrument"],
    },
    ThemeConfig {
        slug: "detente",
        name: "Détente",
        emoji: "🧘",
        environments: &[Home, Shelter, OpenAir],
        place_types: &["spa", "wellness_center", "sauna"],
        tags: &["detente", "relax", "spa", "yoga", "meditation"],
    },
    ThemeConfig {
        slug: "creatif",
        name: "Créatif",
        emoji: "🎨",
        environments: &[Home, Shelter],
        place_types: &["art_studio"],
        tags: &["creatif", "dessin", "peinture", "bricolage", "diy"],
    },
    ThemeConfig {
        slug: "lecture",
        name: "Lecture",
        emoji: "📚",
        environments: &[Home, Shelter],
        place_types: &["library", "book_store"],
        tags: &["lecture", "lire", "livre", "livres", "bd"],
    },
    ThemeConfig {
        slug: "balade",
        name: "Balade urbaine",
        emoji: "🗺️",
        environments: &[OpenAir],
        place_types: &["tourist_attraction", "historical_landmark", "monument", "plaza"],
        tags: &["visite", "monument", "patrimoine", "flaner"],
    },
    ThemeConfig {
        slug: "aventure",
        name: "Aventure",
        emoji: "🧗",
        environments: &[OpenAir, Shelter],
        place_types: &["amusement_park", "water_park", "zoo", "aquarium"],
        tags: &["aventure", "zoo", "aquarium", "escalade", "sensations"],
    },
    ThemeConfig {
        slug: "shopping",
        name: "Shopping",
        emoji: "🛍️",
        environments: &[Shelter, OpenAir],
        place_types: &["shopping_mall", "market", "flea_market"],
        tags: &["shopping", "boutique", "marche", "brocante"],
    },
];

pub fn catalog() -> &'static [ThemeConfig] {
    CATALOG
}

pub fn by_slug(slug: &str) -> Option<&'static ThemeConfig> {
    CATALOG.iter().find(|t| t.slug == slug)
}

/// Themes eligible for `environment`, in catalog order.
pub fn eligible_themes(environment: Environment) -> Vec<&'static ThemeConfig> {
    CATALOG.iter().filter(|t| t.is_eligible(environment)).collect()
}

/// Two distinct random themes from `pool`.
pub fn pick_duel<'a, R: Rng + ?Sized>(
    pool: &[&'a ThemeConfig],
    rng: &mut R,
) -> Result<(&'a ThemeConfig, &'a ThemeConfig), CatalogError> {
    if pool.len() < 2 {
        return Err(CatalogError::PoolTooSmall(pool.len()));
    }
    let picked: Vec<&&ThemeConfig> = pool.choose_multiple(rng, 2).collect();
    Ok((*picked[0], *picked[1]))
}

/// First catalog entry whose slug equals one of `tags`.
pub fn match_by_tags<S: AsRef<str>>(tags: &[S]) -> Option<&'static ThemeConfig> {
    CATALOG
        .iter()
        .find(|theme| tags.iter().any(|tag| tag.as_ref().eq_ignore_ascii_case(theme.slug)))
}

/// Match a free-text hint against slugs and tag keywords.
pub fn match_hint(hint: &str) -> Option<&'static ThemeConfig> {
    let words: Vec<String> = hint
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(fold_word)
        .collect();
    if words.is_empty() {
        return None;
    }
    if let Some(theme) = match_by_tags(&words) {
        return Some(theme);
    }
    CATALOG
        .iter()
        .find(|theme| theme.tags.iter().any(|tag| words.iter().any(|w| w == tag)))
}

fn fold_word(word: &str) -> String {
    word.to_lowercase()
        .chars()
        .map(|c| match c {
            'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}
