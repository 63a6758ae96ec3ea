//! Built-in data sources written into uniform buffers each frame.

use bytemuck::{Pod, Zeroable};

/// The 16-byte per-frame inputs block: time, surface size, aspect ratio.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PngineInputs {
    pub time: f32,
    pub width: f32,
    pub height: f32,
    pub aspect: f32,
}

impl PngineInputs {
    pub fn new(time: f32, width: u32, height: u32) -> Self {
        let aspect = if height == 0 {
            0.0
        } else {
            width as f32 / height as f32
        };
        Self {
            time,
            width: width as f32,
            height: height as f32,
            aspect,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// The 12-byte scene timeline block: seconds into the scene, scene duration,
/// and normalized progress in `[0, 1)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SceneTimeInputs {
    pub scene_time: f32,
    pub scene_duration: f32,
    pub normalized_time: f32,
}

impl SceneTimeInputs {
    pub fn new(scene_time: f32, scene_duration: f32) -> Self {
        let normalized_time = if scene_duration > 0.0 {
            (scene_time / scene_duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            scene_time,
            scene_duration,
            normalized_time,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_layout_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PngineInputs>(), 16);
        let inputs = PngineInputs::new(1.0, 800, 600);
        let bytes = inputs.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &(800.0f32 / 600.0).to_le_bytes());
    }

    #[test]
    fn scene_time_layout_is_12_bytes() {
        assert_eq!(std::mem::size_of::<SceneTimeInputs>(), 12);
        let inputs = SceneTimeInputs::new(2.0, 4.0);
        assert_eq!(inputs.normalized_time, 0.5);
    }

    #[test]
    fn zero_height_does_not_divide() {
        assert_eq!(PngineInputs::new(0.0, 512, 0).aspect, 0.0);
    }
}
