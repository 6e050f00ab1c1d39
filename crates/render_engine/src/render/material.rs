//! Materials: a tint plus the backend object state that draws with it

use super::types::{ObjectId, INVALID_ID};
use super::texture::next_generation;
use crate::foundation::math::Vec4;

/// Surface description for the object shader
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    /// Debug name
    pub name: String,
    diffuse_colour: Vec4,
    generation: u32,
    /// Backend per-object state, set by `create_material`
    pub object_id: Option<ObjectId>,
}

impl Material {
    /// White material with no backend state yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diffuse_colour: Vec4::new(1.0, 1.0, 1.0, 1.0),
            generation: 0,
            object_id: None,
        }
    }

    /// Set the diffuse tint
    pub fn with_diffuse_colour(mut self, colour: Vec4) -> Self {
        self.set_diffuse_colour(colour);
        self
    }

    /// Change the tint; the next draw re-uploads the material block
    pub fn set_diffuse_colour(&mut self, colour: Vec4) {
        if self.diffuse_colour != colour {
            self.diffuse_colour = colour;
            self.generation = next_generation(self.generation);
        }
    }

    /// Current tint
    pub fn diffuse_colour(&self) -> &Vec4 {
        &self.diffuse_colour
    }

    /// Bumps whenever the uniform data changes
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the backend has acquired object state for this material
    pub fn is_registered(&self) -> bool {
        self.object_id.is_some_and(|id| id.0 != INVALID_ID)
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colour_change_bumps_generation() {
        let mut material = Material::new("red");
        let start = material.generation();

        material.set_diffuse_colour(Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(material.generation(), start + 1);

        // same colour again is not a change
        material.set_diffuse_colour(Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(material.generation(), start + 1);
    }

    #[test]
    fn test_registration() {
        let mut material = Material::default();
        assert!(!material.is_registered());
        material.object_id = Some(ObjectId(3));
        assert!(material.is_registered());
    }
}
