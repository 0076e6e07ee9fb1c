//! Seam traits for the host environment.
//!
//! The store never talks to the host application directly; the consumer
//! injects these at call sites. All three are object-safe so tests can
//! substitute in-memory fakes.

use crate::error::ClashResult;
use crate::geometry::Aabb;

/// Answers "does this external object still exist?".
///
/// Consulted only during staleness verification. Implementations must be
/// safe to call from multiple worker threads at once; independent handles
/// have no ordering dependency.
pub trait ElementExistenceOracle: Send + Sync {
    /// Whether the host environment still contains the referenced object.
    ///
    /// An `Err` is treated conservatively by the verifier: the zone keeps
    /// its current resolution state rather than being guessed at.
    fn exists(&self, handle: &str) -> ClashResult<bool>;
}

/// Supplies placement-derived geometry for an external object handle.
///
/// The store prefers the placed object's bounding box for spatial indexing
/// and only falls back to a tolerance cube around the intersection point
/// when no valid box is available. The store never computes geometry.
pub trait GeometryProvider {
    /// The axis-aligned bounding box of the placed object, if one exists
    /// and the host can produce it.
    fn placed_bounding_box(&self, handle: &str) -> ClashResult<Option<Aabb>>;
}

/// Supplies the active detection scope's host-category selection.
///
/// Used when creating or refreshing a `FileCombo`.
pub trait ScopeProvider {
    /// The host categories currently selected for detection.
    fn selected_host_categories(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::{ElementExistenceOracle, GeometryProvider, ScopeProvider};
    use crate::error::ClashResult;
    use crate::geometry::Aabb;

    struct AlwaysThere;

    impl ElementExistenceOracle for AlwaysThere {
        fn exists(&self, _handle: &str) -> ClashResult<bool> {
            Ok(true)
        }
    }

    struct NoGeometry;

    impl GeometryProvider for NoGeometry {
        fn placed_bounding_box(&self, _handle: &str) -> ClashResult<Option<Aabb>> {
            Ok(None)
        }
    }

    struct FixedScope;

    impl ScopeProvider for FixedScope {
        fn selected_host_categories(&self) -> Vec<String> {
            vec!["Walls".to_owned(), "Floors".to_owned()]
        }
    }

    #[test]
    fn traits_are_object_safe() {
        let oracle: Box<dyn ElementExistenceOracle> = Box::new(AlwaysThere);
        assert!(oracle.exists("h-1").expect("oracle should answer"));

        let geometry: Box<dyn GeometryProvider> = Box::new(NoGeometry);
        assert!(geometry
            .placed_bounding_box("h-1")
            .expect("provider should answer")
            .is_none());

        let scope: Box<dyn ScopeProvider> = Box::new(FixedScope);
        assert_eq!(scope.selected_host_categories().len(), 2);
    }
}
