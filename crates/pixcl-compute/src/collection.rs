//! Thread-safe store of image objects.
//!
//! Images are shared as `Arc<Mutex<ImageObject>>`, so a long kernel run on
//! one image never blocks lookups of the others.

use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::image::{ImageId, ImageObject};

/// Default blank canvas width.
pub const DEFAULT_BLANK_WIDTH: u32 = 1080;
/// Default blank canvas height.
pub const DEFAULT_BLANK_HEIGHT: u32 = 1920;

/// Shared handle to one stored image.
pub type SharedImage = Arc<Mutex<ImageObject>>;

/// Ordered collection of images, addressable by id, name or index.
#[derive(Default)]
pub struct ImageCollection {
    images: RwLock<Vec<(ImageId, SharedImage)>>,
}

impl ImageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an image and return its id.
    pub fn add(&self, image: ImageObject) -> ImageId {
        let id = image.id();
        debug!(image = %id, name = image.name(), "image added");
        self.images.write().unwrap().push((id, Arc::new(Mutex::new(image))));
        id
    }

    /// Decode a file and store it.
    #[cfg(feature = "io")]
    pub fn load_image<P: AsRef<std::path::Path>>(&self, path: P) -> crate::ComputeResult<ImageId> {
        Ok(self.add(ImageObject::load(path)?))
    }

    /// Store a zero-filled canvas; a zero extent uses the default size.
    pub fn pop_empty(&self, width: u32, height: u32) -> ImageId {
        let width = if width == 0 { DEFAULT_BLANK_WIDTH } else { width };
        let height = if height == 0 { DEFAULT_BLANK_HEIGHT } else { height };
        self.add(ImageObject::blank(width, height))
    }

    pub fn get(&self, id: ImageId) -> Option<SharedImage> {
        self.images
            .read()
            .unwrap()
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, img)| Arc::clone(img))
    }

    /// First image whose name matches (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<SharedImage> {
        self.images
            .read()
            .unwrap()
            .iter()
            .find(|(_, img)| img.lock().unwrap().name().eq_ignore_ascii_case(name))
            .map(|(_, img)| Arc::clone(img))
    }

    /// Image at insertion position `index`.
    pub fn get_at(&self, index: usize) -> Option<SharedImage> {
        self.images.read().unwrap().get(index).map(|(_, img)| Arc::clone(img))
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<ImageId> {
        self.images.read().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// Remove an image. Its device buffer, if any, stays registered.
    pub fn remove(&self, id: ImageId) -> Option<SharedImage> {
        let mut images = self.images.write().unwrap();
        let pos = images.iter().position(|(i, _)| *i == id)?;
        Some(images.remove(pos).1)
    }

    /// Remove every image, returning them.
    pub fn clear(&self) -> Vec<SharedImage> {
        self.images
            .write()
            .unwrap()
            .drain(..)
            .map(|(_, img)| img)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.images.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_name_index() {
        let images = ImageCollection::new();
        let a = images.add(ImageObject::from_pixels("Sunset", vec![0; 4], 1, 1));
        let b = images.pop_empty(2, 2);

        assert_eq!(images.len(), 2);
        assert_eq!(images.get(a).unwrap().lock().unwrap().name(), "Sunset");
        assert_eq!(images.find_by_name("sunset").unwrap().lock().unwrap().id(), a);
        assert_eq!(images.get_at(1).unwrap().lock().unwrap().id(), b);
        assert!(images.get_at(2).is_none());
        assert_eq!(images.ids(), vec![a, b]);
    }

    #[test]
    fn test_pop_empty_default_size() {
        let images = ImageCollection::new();
        let id = images.pop_empty(0, 0);
        let img = images.get(id).unwrap();
        let img = img.lock().unwrap();
        assert_eq!((img.width(), img.height()), (1080, 1920));
    }

    #[test]
    fn test_remove_and_clear() {
        let images = ImageCollection::new();
        let a = images.pop_empty(1, 1);
        images.pop_empty(1, 1);

        assert!(images.remove(a).is_some());
        assert!(images.remove(a).is_none());
        assert_eq!(images.clear().len(), 1);
        assert!(images.is_empty());
    }
}
