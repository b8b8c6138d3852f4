//! Logical render state and redundant-native-call elimination.
//!
//! A [`StateTracker`] owns the snapshot of everything the native API was
//! last told, plus the default snapshot a fresh context starts from. Every
//! setter diffs against the snapshot and only crosses into the native layer
//! on an actual change, so replaying a full state description costs nothing
//! for the parts that did not move.

use std::collections::HashMap;

use crate::resource::ResourceId;

pub type Color = [f32; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFunction {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStyle {
    Solid,
    Line,
    Point,
    None,
}

/// Which faces a draw style applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawStyles {
    pub front: DrawStyle,
    pub back: DrawStyle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Material colors as last issued (post-clamp).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub ambient: Color,
    pub diffuse: Color,
    pub specular: Color,
    pub emissive: Color,
}

/// Snapshot of every piece of tracked native state.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub blend_enabled: bool,
    pub blend_color: Color,
    pub blend_function: BlendFunction,
    pub blend_src: BlendFactor,
    pub blend_dst: BlendFactor,
    pub color_mask: [bool; 4],
    pub depth_test: Comparison,
    pub depth_write: bool,
    pub depth_offset_factor: f32,
    pub depth_offset_units: f32,
    pub draw_styles: DrawStyles,
    pub viewport: Viewport,
    pub textures: HashMap<u32, ResourceId>,
    pub attributes: HashMap<u32, ResourceId>,
    pub shader: Option<ResourceId>,
    pub material: Material,
    pub global_ambient: Color,
}

impl Default for RenderState {
    fn default() -> Self {
        RenderState {
            blend_enabled: false,
            blend_color: [0.0, 0.0, 0.0, 0.0],
            blend_function: BlendFunction::Add,
            blend_src: BlendFactor::One,
            blend_dst: BlendFactor::Zero,
            color_mask: [true; 4],
            depth_test: Comparison::Less,
            depth_write: true,
            depth_offset_factor: 0.0,
            depth_offset_units: 0.0,
            draw_styles: DrawStyles {
                front: DrawStyle::Solid,
                back: DrawStyle::None,
            },
            viewport: Viewport {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
            },
            textures: HashMap::new(),
            attributes: HashMap::new(),
            shader: None,
            material: Material {
                ambient: [0.2, 0.2, 0.2, 1.0],
                diffuse: [0.8, 0.8, 0.8, 1.0],
                specular: [0.0, 0.0, 0.0, 1.0],
                emissive: [0.0, 0.0, 0.0, 1.0],
            },
            global_ambient: [0.2, 0.2, 0.2, 1.0],
        }
    }
}

/// The native-call sink a tracker drives. One method per tracked state
/// group; a call means the state actually changed.
pub trait NativeCalls {
    fn set_blend_enabled(&mut self, enabled: bool);
    fn set_blend_color(&mut self, color: Color);
    fn set_blend_mode(&mut self, function: BlendFunction, src: BlendFactor, dst: BlendFactor);
    fn set_color_mask(&mut self, mask: [bool; 4]);
    fn set_depth_test(&mut self, test: Comparison);
    fn set_depth_write(&mut self, write: bool);
    fn set_depth_offsets(&mut self, factor: f32, units: f32);
    fn set_draw_styles(&mut self, styles: DrawStyles);
    fn set_viewport(&mut self, viewport: Viewport);
    fn bind_texture(&mut self, unit: u32, texture: Option<ResourceId>);
    fn bind_array_buffer(&mut self, buffer: Option<ResourceId>);
    fn set_attribute_pointer(&mut self, slot: u32, buffer: ResourceId);
    fn disable_attribute(&mut self, slot: u32);
    fn bind_shader(&mut self, shader: Option<ResourceId>);
    fn set_material(&mut self, material: Material);
    fn set_global_ambient(&mut self, color: Color);
}

fn clamp_unit(color: Color) -> Color {
    [
        color[0].clamp(0.0, 1.0),
        color[1].clamp(0.0, 1.0),
        color[2].clamp(0.0, 1.0),
        color[3].clamp(0.0, 1.0),
    ]
}

fn clamp_positive(color: Color) -> Color {
    [
        color[0].max(0.0),
        color[1].max(0.0),
        color[2].max(0.0),
        color[3].max(0.0),
    ]
}

/// Diffs requested state against the snapshot and forwards only changes.
pub struct StateTracker<C: NativeCalls> {
    calls: C,
    current: RenderState,
    defaults: RenderState,
    /// How many attribute slots the currently bound array buffer serves.
    /// The native unbind happens only when this drops to zero.
    array_buffer: Option<(ResourceId, u32)>,
}

impl<C: NativeCalls> StateTracker<C> {
    /// `defaults` is the state a freshly activated context is in; the
    /// tracker assumes the native side currently matches it.
    pub fn new(calls: C, defaults: RenderState) -> Self {
        StateTracker {
            calls,
            current: defaults.clone(),
            defaults,
            array_buffer: None,
        }
    }

    pub fn calls(&self) -> &C {
        &self.calls
    }

    pub fn current(&self) -> &RenderState {
        &self.current
    }

    /// Re-baselines the defaults to the current snapshot. Used after
    /// context activation applied a known state wholesale.
    pub fn mark_default(&mut self) {
        self.defaults = self.current.clone();
    }

    /// Restores every tracked group to the default snapshot, through the
    /// same diffing as the individual setters.
    pub fn reset(&mut self) {
        let defaults = self.defaults.clone();
        self.set_blend_enabled(defaults.blend_enabled);
        self.set_blend_color(defaults.blend_color);
        self.set_blend_mode(defaults.blend_function, defaults.blend_src, defaults.blend_dst);
        self.set_color_mask(defaults.color_mask);
        self.set_depth_test(defaults.depth_test);
        self.set_depth_write(defaults.depth_write);
        self.set_depth_offsets(defaults.depth_offset_factor, defaults.depth_offset_units);
        self.set_draw_styles(defaults.draw_styles);
        self.set_viewport(defaults.viewport);
        self.set_shader(defaults.shader);
        self.set_material(defaults.material);
        self.set_global_ambient(defaults.global_ambient);

        let stale_units: Vec<u32> = self
            .current
            .textures
            .keys()
            .filter(|unit| !self.defaults.textures.contains_key(*unit))
            .copied()
            .collect();
        for unit in stale_units {
            self.bind_texture(unit, None);
        }
        let default_textures: Vec<(u32, ResourceId)> = self
            .defaults
            .textures
            .iter()
            .map(|(unit, id)| (*unit, *id))
            .collect();
        for (unit, id) in default_textures {
            self.bind_texture(unit, Some(id));
        }

        let stale_slots: Vec<u32> = self.current.attributes.keys().copied().collect();
        for slot in stale_slots {
            self.unbind_attribute(slot);
        }
    }

    pub fn set_blend_enabled(&mut self, enabled: bool) {
        if self.current.blend_enabled != enabled {
            self.current.blend_enabled = enabled;
            self.calls.set_blend_enabled(enabled);
        }
    }

    pub fn set_blend_color(&mut self, color: Color) {
        let color = clamp_unit(color);
        if self.current.blend_color != color {
            self.current.blend_color = color;
            self.calls.set_blend_color(color);
        }
    }

    pub fn set_blend_mode(&mut self, function: BlendFunction, src: BlendFactor, dst: BlendFactor) {
        if self.current.blend_function != function
            || self.current.blend_src != src
            || self.current.blend_dst != dst
        {
            self.current.blend_function = function;
            self.current.blend_src = src;
            self.current.blend_dst = dst;
            self.calls.set_blend_mode(function, src, dst);
        }
    }

    pub fn set_color_mask(&mut self, mask: [bool; 4]) {
        if self.current.color_mask != mask {
            self.current.color_mask = mask;
            self.calls.set_color_mask(mask);
        }
    }

    pub fn set_depth_test(&mut self, test: Comparison) {
        if self.current.depth_test != test {
            self.current.depth_test = test;
            self.calls.set_depth_test(test);
        }
    }

    pub fn set_depth_write(&mut self, write: bool) {
        if self.current.depth_write != write {
            self.current.depth_write = write;
            self.calls.set_depth_write(write);
        }
    }

    pub fn set_depth_offsets(&mut self, factor: f32, units: f32) {
        if self.current.depth_offset_factor != factor || self.current.depth_offset_units != units {
            self.current.depth_offset_factor = factor;
            self.current.depth_offset_units = units;
            self.calls.set_depth_offsets(factor, units);
        }
    }

    pub fn set_draw_styles(&mut self, styles: DrawStyles) {
        if self.current.draw_styles != styles {
            self.current.draw_styles = styles;
            self.calls.set_draw_styles(styles);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.current.viewport != viewport {
            self.current.viewport = viewport;
            self.calls.set_viewport(viewport);
        }
    }

    pub fn bind_texture(&mut self, unit: u32, texture: Option<ResourceId>) {
        match texture {
            Some(id) => {
                if self.current.textures.get(&unit) != Some(&id) {
                    self.current.textures.insert(unit, id);
                    self.calls.bind_texture(unit, Some(id));
                }
            }
            None => {
                if self.current.textures.remove(&unit).is_some() {
                    self.calls.bind_texture(unit, None);
                }
            }
        }
    }

    pub fn set_shader(&mut self, shader: Option<ResourceId>) {
        if self.current.shader != shader {
            self.current.shader = shader;
            self.calls.bind_shader(shader);
        }
    }

    /// Material colors are clamped before both the diff and the native
    /// call: ambient/diffuse/specular to [0, 1], emissive to [0, inf).
    pub fn set_material(&mut self, material: Material) {
        let clamped = Material {
            ambient: clamp_unit(material.ambient),
            diffuse: clamp_unit(material.diffuse),
            specular: clamp_unit(material.specular),
            emissive: clamp_positive(material.emissive),
        };
        if self.current.material != clamped {
            self.current.material = clamped;
            self.calls.set_material(clamped);
        }
    }

    pub fn set_global_ambient(&mut self, color: Color) {
        let color = clamp_positive(color);
        if self.current.global_ambient != color {
            self.current.global_ambient = color;
            self.calls.set_global_ambient(color);
        }
    }

    /// Points `slot` at `buffer`, sharing one native array-buffer binding
    /// across slots reading from the same buffer.
    pub fn bind_attribute(&mut self, slot: u32, buffer: ResourceId) {
        if self.current.attributes.get(&slot) == Some(&buffer) {
            return;
        }
        let previous = self.current.attributes.insert(slot, buffer);
        self.bind_array_buffer(buffer);
        self.calls.set_attribute_pointer(slot, buffer);
        if let Some(previous) = previous {
            self.release_array_buffer(previous);
        }
    }

    /// Stops sourcing `slot`, unbinding the native array buffer only when
    /// no other slot still reads from it.
    pub fn unbind_attribute(&mut self, slot: u32) {
        if let Some(previous) = self.current.attributes.remove(&slot) {
            self.calls.disable_attribute(slot);
            self.release_array_buffer(previous);
        }
    }

    fn bind_array_buffer(&mut self, buffer: ResourceId) {
        match &mut self.array_buffer {
            Some((bound, count)) if *bound == buffer => *count += 1,
            _ => {
                // a different buffer: slots on the old one keep their
                // pointers, only the *binding* moves
                self.calls.bind_array_buffer(Some(buffer));
                self.array_buffer = Some((buffer, 1));
            }
        }
    }

    fn release_array_buffer(&mut self, buffer: ResourceId) {
        if let Some((bound, count)) = &mut self.array_buffer {
            if *bound == buffer {
                *count -= 1;
                if *count == 0 {
                    self.calls.bind_array_buffer(None);
                    self.array_buffer = None;
                }
            }
        }
    }
}
