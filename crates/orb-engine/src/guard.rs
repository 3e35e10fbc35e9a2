use orb_cache::DomainObject;

/// Decides whether an object may be deleted. A delete is refused when any
/// object in the dependent subtree is refused.
pub trait DeleteGuard: Send + Sync {
    fn may_delete(&self, object: &DomainObject) -> bool;
}

/// Permits every delete.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl DeleteGuard for AllowAll {
    fn may_delete(&self, _object: &DomainObject) -> bool {
        true
    }
}

impl<F> DeleteGuard for F
where
    F: Fn(&DomainObject) -> bool + Send + Sync,
{
    fn may_delete(&self, object: &DomainObject) -> bool {
        self(object)
    }
}
