//! Accelerated-plan builder interface
//!
//! Operators that know how to describe themselves append steps to a
//! [`PlanBuilder`]; the engine treats the finished [`Plan`] as an opaque
//! value handed to an external executor. Only the option vocabulary is
//! fixed here; execution lives outside the core.

use serde::{Deserialize, Serialize};

use crate::types::error::PipelineError;
use crate::types::Result;

/// Interpolation filters understood by plan executors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Nearest-neighbor sampling
    Nearest,
    /// Bilinear
    Linear,
    /// Bicubic
    Cubic,
    /// Pixel-area relation
    Area,
    /// Lanczos over an 8x8 neighborhood
    Lanczos4,
    /// Bit-exact bilinear
    LinearExact,
    /// Max-pooling interpolation
    Max,
    /// Fill all destination pixels when warping
    WarpFillOutliers,
}

/// Decode target colorspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeMode {
    /// Force three-channel RGB
    Rgb,
    /// Keep the encoded channel layout
    Unchanged,
}

/// Axis of a flip step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipCode {
    /// Mirror across the horizontal axis
    TopBottom,
    /// Mirror across the vertical axis
    LeftRight,
}

/// Rotation parameter: exactly one of a fixed angle or a random range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Rotation {
    /// Rotate by a fixed angle in degrees
    Angle(f32),
    /// Rotate by a uniform angle in `[-range, range]` degrees
    RandomRange(u32),
}

/// Where a lua step's code comes from: a file or an inline chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LuaSource {
    /// Load the script from a file
    File(String),
    /// Use the given chunk verbatim
    Inline(String),
}

/// Parameters of a random-area crop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomCropSpec {
    /// Output side length
    pub final_size: u32,
    /// Lower bound of the sampled area fraction
    pub scale_min: f32,
    /// Upper bound of the sampled area fraction
    pub scale_max: f32,
    /// Lower bound of the sampled aspect ratio
    pub ratio_min: f32,
    /// Upper bound of the sampled aspect ratio
    pub ratio_max: f32,
    /// Resampling filter for the final resize
    pub interpolation: Interpolation,
}

/// One step of an accelerated plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlanStep {
    /// Decode an encoded image
    Decode {
        /// Target colorspace
        mode: DecodeMode,
    },
    /// Resize to exact dimensions
    Resize {
        /// Output width
        w: u32,
        /// Output height
        h: u32,
        /// Resampling filter
        interpolation: Interpolation,
    },
    /// Resize so the short side matches `short_size`
    ResizeShort {
        /// Target short-side length
        short_size: u32,
        /// Resampling filter
        interpolation: Interpolation,
    },
    /// Crop a fixed rectangle
    Crop {
        /// Left edge
        x: u32,
        /// Top edge
        y: u32,
        /// Width
        w: u32,
        /// Height
        h: u32,
    },
    /// Crop around the image center
    CenterCrop {
        /// Width
        w: u32,
        /// Height
        h: u32,
        /// Bias the crop to the exact center instead of the top-left
        crop_center: bool,
    },
    /// Random-area crop and resize
    RandomCrop(RandomCropSpec),
    /// Rotate
    Rotate(Rotation),
    /// Mirror
    Flip {
        /// Axis to mirror across
        code: FlipCode,
        /// Apply with probability one half instead of always
        random: bool,
    },
    /// Transpose HWC to CHW layout
    ToChw,
    /// Run a lua chunk
    Lua {
        /// Script location
        source: LuaSource,
        /// Transpose to CHW after the chunk
        to_chw: bool,
    },
}

/// An opaque, ordered list of plan steps for an external executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Whether the plan holds no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Collects plan steps appended by operators.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decode step; `to_rgb` selects RGB over the encoded layout.
    pub fn decode(&mut self, to_rgb: bool) -> &mut Self {
        let mode = if to_rgb {
            DecodeMode::Rgb
        } else {
            DecodeMode::Unchanged
        };
        self.steps.push(PlanStep::Decode { mode });
        self
    }

    /// Append an exact resize.
    pub fn resize(&mut self, w: u32, h: u32, interpolation: Interpolation) -> &mut Self {
        self.steps.push(PlanStep::Resize { w, h, interpolation });
        self
    }

    /// Append a short-side resize.
    pub fn resize_short(&mut self, short_size: u32, interpolation: Interpolation) -> &mut Self {
        self.steps.push(PlanStep::ResizeShort {
            short_size,
            interpolation,
        });
        self
    }

    /// Append a fixed-rectangle crop.
    pub fn crop(&mut self, x: u32, y: u32, w: u32, h: u32) -> &mut Self {
        self.steps.push(PlanStep::Crop { x, y, w, h });
        self
    }

    /// Append a center crop.
    pub fn center_crop(&mut self, w: u32, h: u32, crop_center: bool) -> &mut Self {
        self.steps.push(PlanStep::CenterCrop { w, h, crop_center });
        self
    }

    /// Append a random-area crop after validating its ranges.
    pub fn random_crop(&mut self, spec: RandomCropSpec) -> Result<&mut Self> {
        if spec.scale_min > spec.scale_max || spec.ratio_min > spec.ratio_max {
            return Err(PipelineError::InvalidArgument(format!(
                "random_crop ranges are inverted: scale [{}, {}], ratio [{}, {}]",
                spec.scale_min, spec.scale_max, spec.ratio_min, spec.ratio_max
            ))
            .into());
        }
        self.steps.push(PlanStep::RandomCrop(spec));
        Ok(self)
    }

    /// Append a rotation; the enum makes angle and range mutually exclusive.
    pub fn rotate(&mut self, rotation: Rotation) -> &mut Self {
        self.steps.push(PlanStep::Rotate(rotation));
        self
    }

    /// Append a flip.
    pub fn flip(&mut self, code: FlipCode, random: bool) -> &mut Self {
        self.steps.push(PlanStep::Flip { code, random });
        self
    }

    /// Append an HWC to CHW transpose.
    pub fn to_chw(&mut self) -> &mut Self {
        self.steps.push(PlanStep::ToChw);
        self
    }

    /// Append a lua step.
    pub fn lua(&mut self, source: LuaSource, to_chw: bool) -> &mut Self {
        self.steps.push(PlanStep::Lua { source, to_chw });
        self
    }

    /// Finish, handing the accumulated steps over as a plan.
    pub fn build(self) -> Plan {
        Plan { steps: self.steps }
    }

    /// Steps appended so far.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_steps_in_order() {
        let mut b = PlanBuilder::new();
        b.decode(true)
            .resize_short(256, Interpolation::Lanczos4)
            .center_crop(224, 224, true)
            .to_chw();
        let plan = b.build();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0], PlanStep::Decode { mode: DecodeMode::Rgb });
        assert_eq!(plan.steps[3], PlanStep::ToChw);
    }

    #[test]
    fn inverted_random_crop_ranges_are_rejected() {
        let mut b = PlanBuilder::new();
        let err = b
            .random_crop(RandomCropSpec {
                final_size: 224,
                scale_min: 1.0,
                scale_max: 0.08,
                ratio_min: 0.75,
                ratio_max: 1.33,
                interpolation: Interpolation::Linear,
            })
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::types::Error::Pipeline(PipelineError::InvalidArgument(_))
        ));
    }
}
