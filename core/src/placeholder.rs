use core::fmt;

/// A SQL parameter placeholder.
///
/// A labeled placeholder gets its final name from the statement's
/// [`Placeholders`] counter at render time, so two conditions built
/// independently never produce the same name. A fixed placeholder keeps the
/// name it was given (raw SQL, INSERT column binds).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Placeholder {
    /// `{label}_{n}` with `n` drawn from the statement counter
    Labeled(String),
    /// `:name` verbatim
    Fixed(String),
}

impl Placeholder {
    /// Creates a labeled placeholder. Dots (from `t.` / `r.` qualifiers)
    /// become underscores.
    pub fn labeled(label: &str) -> Self {
        Placeholder::Labeled(label.replace('.', "_"))
    }

    /// Creates a placeholder with a fixed name.
    pub fn fixed(name: impl Into<String>) -> Self {
        Placeholder::Fixed(name.into())
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placeholder::Labeled(label) => write!(f, ":{label}_?"),
            Placeholder::Fixed(name) => write!(f, ":{name}"),
        }
    }
}

/// Monotonic discriminator source owned by one statement render.
#[derive(Debug, Default)]
pub struct Placeholders {
    next: u32,
}

impl Placeholders {
    #[inline]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Resolves the final parameter name for `placeholder`.
    pub fn resolve(&mut self, placeholder: &Placeholder) -> String {
        match placeholder {
            Placeholder::Labeled(label) => {
                let n = self.next;
                self.next += 1;
                format!("{label}_{n}")
            }
            Placeholder::Fixed(name) => name.clone(),
        }
    }
}
