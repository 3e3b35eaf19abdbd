use std::{fmt::Display, hash::Hash, sync::Arc};

/// A seeded entrant of the elimination stage.
///
/// Built once from the seed table and shared behind an [`Arc`] for the rest of the run.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Submission name, unique across the whole tournament.
    pub name: String,
    /// Group the participant qualified from.
    pub group: String,
    /// Seed rank, 1 is the best.
    pub seed: u32,
    /// Wins collected during the group stage.
    pub wins: u32,
    /// Total score collected during the group stage.
    pub total_score: f64,
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.seed == other.seed
    }
}

impl Eq for Participant {}

impl Hash for Participant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.seed.hash(state);
    }
}

impl Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.seed, self.name)
    }
}

impl Participant {
    pub fn new(name: impl Into<String>, group: impl Into<String>, seed: u32) -> Participant {
        Participant {
            name: name.into(),
            group: group.into(),
            seed,
            wins: 0,
            total_score: 0.0,
        }
    }

    pub fn with_stats(mut self, wins: u32, total_score: f64) -> Participant {
        self.wins = wins;
        self.total_score = total_score;
        self
    }

    /// Lower seed number wins; equal seeds keep `self`.
    pub fn better_seeded<'a>(self: &'a Arc<Self>, other: &'a Arc<Self>) -> &'a Arc<Self> {
        if other.seed < self.seed {
            other
        } else {
            self
        }
    }
}

/// In-game role as understood by the game server. Circle moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Circle,
    Square,
}

impl Role {
    pub fn opponent(self) -> Role {
        match self {
            Role::Circle => Role::Square,
            Role::Square => Role::Circle,
        }
    }

    /// Label used on the command line and in server logs.
    pub fn label(self) -> &'static str {
        match self {
            Role::Circle => "circle",
            Role::Square => "square",
        }
    }

    pub fn from_label(label: &str) -> Option<Role> {
        if label.eq_ignore_ascii_case("circle") {
            Some(Role::Circle)
        } else if label.eq_ignore_ascii_case("square") {
            Some(Role::Square)
        } else {
            None
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Position of a participant inside a [`Match`](crate::bracket::Match).
///
/// `First` is the bracket's upper slot (the better seed in round one). It also names the
/// `player1` directory and log files of the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::First => Slot::Second,
            Slot::Second => Slot::First,
        }
    }

    /// `player1` / `player2`, the names used for directories and log files.
    pub fn dir_name(self) -> &'static str {
        match self {
            Slot::First => "player1",
            Slot::Second => "player2",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn better_seed_is_lower_number() {
        let a = Arc::new(Participant::new("a", "G1", 3));
        let b = Arc::new(Participant::new("b", "G2", 1));
        assert_eq!(a.better_seeded(&b).name, "b");
        assert_eq!(b.better_seeded(&a).name, "b");
    }

    #[test]
    fn role_labels() {
        assert_eq!(Role::from_label("CIRCLE"), Some(Role::Circle));
        assert_eq!(Role::from_label("square"), Some(Role::Square));
        assert_eq!(Role::from_label("draw"), None);
        assert_eq!(Role::Circle.opponent(), Role::Square);
    }
}
