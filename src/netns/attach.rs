use super::{Error, LinkOps, NamespaceOps, Result};

/// Creates the vcan interface `name` inside the network namespace of `pid` and sets it up.
///
/// The calling thread is moved into the target namespace for the duration of the call and
/// moved back before returning, on success and on every failure. An interface that was
/// created but could not be set up is deleted again.
///
/// Never retries.
///
/// # Errors
///
/// Returns the first failing step's error. If moving back into the original namespace fails,
/// [`Error::RestoreNamespace`] is returned instead and the calling thread must not be reused.
pub fn attach_vcan<B>(backend: &B, pid: u32, name: &str) -> Result<()>
where
    B: NamespaceOps + LinkOps,
{
    let original = backend.current()?;
    let target = backend.for_pid(pid)?;

    let result = configure_in(backend, &target, name);

    if let Err(err) = backend.enter(&original) {
        if let Err(ref attach_err) = result {
            log::error!("Attachment failed before namespace restore: {}", attach_err);
        }
        return Err(Error::RestoreNamespace {
            source: Box::new(err),
        });
    }

    result
}

fn configure_in<B>(backend: &B, target: &B::Handle, name: &str) -> Result<()>
where
    B: NamespaceOps + LinkOps,
{
    backend.enter(target)?;
    backend.add_vcan(name)?;

    if let Err(err) = backend.set_up(name) {
        if let Err(del_err) = backend.delete(name) {
            log::warn!("Failed to delete half-configured link `{}`: {}", name, del_err);
        }
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    use super::*;

    const HOST_NS: u32 = 0;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        ForPid,
        Enter,
        Restore,
        AddLink,
        SetUp,
        Delete,
    }

    /// In-memory namespaces: handle `0` is the host, handle `pid` belongs to process `pid`.
    #[derive(Default)]
    struct FakeNetns {
        current: RefCell<u32>,
        links: RefCell<HashMap<u32, HashSet<String>>>,
        up: RefCell<HashSet<(u32, String)>>,
        enters: RefCell<usize>,
        fail: Option<Step>,
    }

    impl FakeNetns {
        fn failing(step: Step) -> Self {
            Self {
                fail: Some(step),
                ..Default::default()
            }
        }

        fn check(&self, step: Step) -> Result<()> {
            if self.fail == Some(step) {
                return Err(Error::LinkNotFound {
                    name: format!("{step:?}"),
                });
            }
            Ok(())
        }

        fn links_in(&self, ns: u32) -> HashSet<String> {
            self.links.borrow().get(&ns).cloned().unwrap_or_default()
        }
    }

    impl NamespaceOps for FakeNetns {
        type Handle = u32;

        fn current(&self) -> Result<u32> {
            Ok(*self.current.borrow())
        }

        fn for_pid(&self, pid: u32) -> Result<u32> {
            self.check(Step::ForPid)?;
            Ok(pid)
        }

        fn enter(&self, handle: &u32) -> Result<()> {
            let nth = {
                let mut enters = self.enters.borrow_mut();
                *enters += 1;
                *enters
            };
            match nth {
                1 => self.check(Step::Enter)?,
                _ => self.check(Step::Restore)?,
            }
            *self.current.borrow_mut() = *handle;
            Ok(())
        }
    }

    impl LinkOps for FakeNetns {
        fn add_vcan(&self, name: &str) -> Result<()> {
            self.check(Step::AddLink)?;
            let ns = *self.current.borrow();
            self.links
                .borrow_mut()
                .entry(ns)
                .or_default()
                .insert(name.to_owned());
            Ok(())
        }

        fn set_up(&self, name: &str) -> Result<()> {
            self.check(Step::SetUp)?;
            let ns = *self.current.borrow();
            self.up.borrow_mut().insert((ns, name.to_owned()));
            Ok(())
        }

        fn delete(&self, name: &str) -> Result<()> {
            self.check(Step::Delete)?;
            let ns = *self.current.borrow();
            if let Some(links) = self.links.borrow_mut().get_mut(&ns) {
                links.remove(name);
            }
            Ok(())
        }
    }

    #[test]
    fn test_attach_vcan_success() {
        let netns = FakeNetns::default();
        attach_vcan(&netns, 42, "vcan0").expect("attachment should succeed");

        assert_eq!(*netns.current.borrow(), HOST_NS);
        assert!(netns.links_in(42).contains("vcan0"));
        assert!(netns.links_in(HOST_NS).is_empty());
        assert!(netns.up.borrow().contains(&(42, "vcan0".to_owned())));
    }

    #[test]
    fn test_attach_vcan_restores_namespace_on_every_failure() {
        for step in [Step::ForPid, Step::Enter, Step::AddLink, Step::SetUp] {
            let netns = FakeNetns::failing(step);
            let result = attach_vcan(&netns, 42, "vcan0");
            assert!(result.is_err(), "{step:?} should fail the attachment");
            assert!(!result.unwrap_err().is_fatal(), "{step:?} is not fatal");
            assert_eq!(*netns.current.borrow(), HOST_NS, "{step:?} leaked namespace");
        }
    }

    #[test]
    fn test_attach_vcan_deletes_link_when_set_up_fails() {
        let netns = FakeNetns::failing(Step::SetUp);
        let err = attach_vcan(&netns, 42, "vcan0").unwrap_err();

        assert!(matches!(err, Error::LinkNotFound { name } if name == "SetUp"));
        assert!(netns.links_in(42).is_empty());
        assert!(netns.up.borrow().is_empty());
    }

    #[test]
    fn test_attach_vcan_restore_failure_is_fatal() {
        let netns = FakeNetns::failing(Step::Restore);
        let err = attach_vcan(&netns, 42, "vcan0").unwrap_err();

        assert!(matches!(err, Error::RestoreNamespace { .. }));
        assert!(err.is_fatal());
    }
}
