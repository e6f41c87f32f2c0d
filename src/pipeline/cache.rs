//! Single-slot memo for prompt conditioning.

/// Which conditioning a cache slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Conditional,
    Unconditional,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    prompts: Vec<String>,
    steps: u32,
    value: T,
}

/// Remembers the most recent `(prompts, steps)` result for each polarity.
///
/// A lookup with a different key recomputes and replaces the entry.
#[derive(Debug, Clone)]
pub struct ConditioningCache<T> {
    conditional: Option<Entry<T>>,
    unconditional: Option<Entry<T>>,
}

impl<T> Default for ConditioningCache<T> {
    fn default() -> Self {
        Self {
            conditional: None,
            unconditional: None,
        }
    }
}

impl<T: Clone> ConditioningCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `(prompts, steps)` or compute and store it.
    ///
    /// # Errors
    ///
    /// Propagates the error of `compute`; the slot keeps its previous entry.
    pub fn get_or_compute<E, F>(&mut self, slot: Polarity, prompts: &[String], steps: u32, compute: F) -> Result<T, E>
    where
        F: FnOnce(&[String], u32) -> Result<T, E>,
    {
        let entry = match slot {
            Polarity::Conditional => &mut self.conditional,
            Polarity::Unconditional => &mut self.unconditional,
        };

        if let Some(cached) = entry.as_ref() {
            if cached.steps == steps && cached.prompts == prompts {
                return Ok(cached.value.clone());
            }
        }

        let value = compute(prompts, steps)?;
        *entry = Some(Entry {
            prompts: prompts.to_vec(),
            steps,
            value: value.clone(),
        });
        Ok(value)
    }

    /// Drop both entries.
    pub fn clear(&mut self) {
        self.conditional = None;
        self.unconditional = None;
    }
}
