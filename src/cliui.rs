//! Blocking interactive prompts.
//!
//! Everything interactive goes through [`Prompt`] so the menu machinery can
//! be swapped out in tests.

use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};

use crate::errors::{RecoveryError, Result};

pub trait Prompt {
    /// Displays a menu with the given title and returns the index of the
    /// chosen option. Cancellation maps to [`RecoveryError::Aborted`].
    fn select(&self, title: &str, options: &[String]) -> Result<usize>;

    /// Asks a yes/no question; only an explicit yes returns `true`.
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Terminal implementation backed by dialoguer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MenuPrompt;

impl Prompt for MenuPrompt {
    fn select(&self, title: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            return Err(RecoveryError::Config("no options provided".to_string()));
        }

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(title)
            .default(0)
            .items(options)
            .interact_opt()
            .map_err(|error| RecoveryError::Aborted(format!("selection failed: {error}")))?;

        selection.ok_or_else(|| RecoveryError::Aborted("user cancelled".to_string()))
    }

    fn confirm(&self, message: &str) -> Result<bool> {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(message)
            .default(false)
            .interact()
            .map_err(|error| RecoveryError::Aborted(format!("confirmation failed: {error}")))
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted prompt used by unit tests.

    use std::cell::RefCell;

    use super::Prompt;
    use crate::errors::{RecoveryError, Result};

    pub struct ScriptedPrompt {
        selections: RefCell<Vec<usize>>,
        confirmations: RefCell<Vec<bool>>,
    }

    impl ScriptedPrompt {
        pub fn new(selections: Vec<usize>, confirmations: Vec<bool>) -> Self {
            ScriptedPrompt {
                selections: RefCell::new(selections),
                confirmations: RefCell::new(confirmations),
            }
        }
    }

    impl Prompt for ScriptedPrompt {
        fn select(&self, _title: &str, options: &[String]) -> Result<usize> {
            let mut selections = self.selections.borrow_mut();
            if selections.is_empty() {
                return Err(RecoveryError::Aborted("user cancelled".to_string()));
            }
            let index = selections.remove(0);
            assert!(index < options.len(), "scripted selection out of range");
            Ok(index)
        }

        fn confirm(&self, _message: &str) -> Result<bool> {
            let mut confirmations = self.confirmations.borrow_mut();
            if confirmations.is_empty() {
                return Err(RecoveryError::Aborted("user cancelled".to_string()));
            }
            Ok(confirmations.remove(0))
        }
    }
}
