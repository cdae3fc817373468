// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A stack of deferred restore actions.

/// An ordered stack of undo actions, unwound in reverse push order.
///
/// Every successfully applied device mutation pushes its exact inverse here,
/// so the stack always describes the path from the current device state back
/// to the pre-test one. The unwind runs on scope exit whichever way the
/// scope is left (normal return, error propagation, or unwinding), and each
/// action runs exactly once.
#[derive(Default)]
pub struct RollbackStack {
    actions: Vec<Action>,
}

struct Action {
    label: String,
    run: Box<dyn FnOnce() -> anyhow::Result<()>>,
}

impl RollbackStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an undo action, to run when the stack unwinds.
    ///
    /// Push the inverse at the moment the operation it reverts succeeds;
    /// anything pushed before the operation could roll back a mutation that
    /// never happened.
    pub fn push(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> anyhow::Result<()> + 'static,
    ) {
        let label = label.into();
        tracing::debug!(action = label.as_str(), "registered rollback action");
        self.actions.push(Action {
            label,
            run: Box::new(action),
        });
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels of the registered actions, oldest first.
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.label.as_str()).collect()
    }

    /// Runs every action in strict reverse push order and empties the stack.
    ///
    /// A failing action is logged and does not stop the remaining actions.
    /// Dropping the stack afterwards is a no-op.
    pub fn unwind_all(&mut self) {
        while let Some(Action { label, run }) = self.actions.pop() {
            tracing::debug!(action = label.as_str(), "rolling back");
            if let Err(err) = run() {
                tracing::error!(
                    action = label.as_str(),
                    error = format!("{err:#}").as_str(),
                    "rollback action failed"
                );
            }
        }
    }
}

impl Drop for RollbackStack {
    fn drop(&mut self) {
        self.unwind_all();
    }
}

#[cfg(test)]
mod tests {
    use super::RollbackStack;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, RollbackStack) {
        (Rc::new(RefCell::new(Vec::new())), RollbackStack::new())
    }

    #[test]
    fn unwind_is_reverse_of_push_order() {
        let (log, mut stack) = recorder();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            stack.push(name, move || {
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        assert_eq!(stack.labels(), ["a", "b", "c"]);
        stack.unwind_all();
        assert_eq!(*log.borrow(), ["c", "b", "a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn failing_action_does_not_stop_the_unwind() {
        let (log, mut stack) = recorder();
        {
            let log = log.clone();
            stack.push("first", move || {
                log.borrow_mut().push("first");
                Ok(())
            });
        }
        stack.push("broken", || anyhow::bail!("tool went away"));
        {
            let log = log.clone();
            stack.push("last", move || {
                log.borrow_mut().push("last");
                Ok(())
            });
        }
        stack.unwind_all();
        assert_eq!(*log.borrow(), ["last", "first"]);
    }

    #[test]
    fn drop_unwinds_unconditionally() {
        let (log, mut stack) = recorder();
        {
            let log = log.clone();
            stack.push("only", move || {
                log.borrow_mut().push("only");
                Ok(())
            });
        }
        drop(stack);
        assert_eq!(*log.borrow(), ["only"]);
    }

    #[test]
    fn actions_run_exactly_once() {
        let (log, mut stack) = recorder();
        {
            let log = log.clone();
            stack.push("once", move || {
                log.borrow_mut().push("once");
                Ok(())
            });
        }
        stack.unwind_all();
        stack.unwind_all();
        drop(stack);
        assert_eq!(*log.borrow(), ["once"]);
    }
}
