//! Shader tags. Every concrete shader class shares the base fields; the
//! class-specific payloads and pre-compile normalisations live in
//! [`ShaderBody`].

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::common::errors::BuildError;
use crate::map::CacheFileEngine;
use crate::tag::{Emitter, TagReference};
use crate::types::class::TagClass;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
/// Engine discriminator stamped into every shader payload.
pub enum ShaderType {
    #[default]
    Environment = 0,
    Model = 1,
    TransparentChicago = 2,
    TransparentChicagoExtended = 3,
    TransparentGeneric = 4,
    TransparentGlass = 5,
    TransparentMeter = 6,
    TransparentPlasma = 7,
    TransparentWater = 8,
}

impl ShaderType {
    /// The discriminator for a concrete shader class.
    pub fn from_class(class: TagClass) -> Option<Self> {
        Some(match class {
            TagClass::ShaderEnvironment => Self::Environment,
            TagClass::ShaderModel => Self::Model,
            TagClass::ShaderTransparentChicago => Self::TransparentChicago,
            TagClass::ShaderTransparentChicagoExtended => Self::TransparentChicagoExtended,
            TagClass::ShaderTransparentGeneric => Self::TransparentGeneric,
            TagClass::ShaderTransparentGlass => Self::TransparentGlass,
            TagClass::ShaderTransparentMeter => Self::TransparentMeter,
            TagClass::ShaderTransparentPlasma => Self::TransparentPlasma,
            TagClass::ShaderTransparentWater => Self::TransparentWater,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// Material colour in float RGB.
pub struct ColorRgb {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

#[derive(Clone, Debug, PartialEq)]
/// Class-specific shader payload.
pub enum ShaderBody {
    Environment {
        bump_map_scale: f32,
        bump_map_scale_x: f32,
        bump_map_scale_y: f32,
        material_color: ColorRgb,
    },
    Model {
        reflection_cutoff_distance: f32,
        reflection_falloff_distance: f32,
        unknown: f32,
    },
    Other,
}

#[derive(Clone, Debug)]
/// A shader tag of any concrete class.
pub struct Shader {
    pub class: TagClass,
    /// Stamped from the class during pre-compile.
    pub shader_type: ShaderType,
    pub flags: u16,
    pub power: f32,
    pub body: ShaderBody,
    pub maps: Vec<TagReference>,
}

impl Shader {
    pub fn read<R: Read>(class: TagClass, reader: &mut R) -> Result<Self> {
        let flags = reader.read_u16::<LE>()?;
        reader.read_u16::<LE>()?;
        let power = reader.read_f32::<LE>()?;
        let body = match class {
            TagClass::ShaderEnvironment => ShaderBody::Environment {
                bump_map_scale: reader.read_f32::<LE>()?,
                bump_map_scale_x: reader.read_f32::<LE>()?,
                bump_map_scale_y: reader.read_f32::<LE>()?,
                material_color: ColorRgb {
                    red: reader.read_f32::<LE>()?,
                    green: reader.read_f32::<LE>()?,
                    blue: reader.read_f32::<LE>()?,
                },
            },
            TagClass::ShaderModel => ShaderBody::Model {
                reflection_cutoff_distance: reader.read_f32::<LE>()?,
                reflection_falloff_distance: reader.read_f32::<LE>()?,
                unknown: reader.read_f32::<LE>()?,
            },
            _ => ShaderBody::Other,
        };
        let map_count = reader.read_u32::<LE>()?;
        let mut maps = Vec::with_capacity(map_count as usize);
        for _ in 0..map_count {
            maps.push(TagReference::read(reader)?);
        }
        Ok(Self {
            class,
            shader_type: ShaderType::default(),
            flags,
            power,
            body,
            maps,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LE>(self.flags)?;
        writer.write_u16::<LE>(0)?;
        writer.write_f32::<LE>(self.power)?;
        match &self.body {
            ShaderBody::Environment {
                bump_map_scale,
                bump_map_scale_x,
                bump_map_scale_y,
                material_color,
            } => {
                writer.write_f32::<LE>(*bump_map_scale)?;
                writer.write_f32::<LE>(*bump_map_scale_x)?;
                writer.write_f32::<LE>(*bump_map_scale_y)?;
                writer.write_f32::<LE>(material_color.red)?;
                writer.write_f32::<LE>(material_color.green)?;
                writer.write_f32::<LE>(material_color.blue)?;
            }
            ShaderBody::Model {
                reflection_cutoff_distance,
                reflection_falloff_distance,
                unknown,
            } => {
                writer.write_f32::<LE>(*reflection_cutoff_distance)?;
                writer.write_f32::<LE>(*reflection_falloff_distance)?;
                writer.write_f32::<LE>(*unknown)?;
            }
            ShaderBody::Other => {}
        }
        writer.write_u32::<LE>(self.maps.len() as u32)?;
        for map in &self.maps {
            map.write(writer)?;
        }
        Ok(())
    }

    pub fn references_mut(&mut self) -> Vec<&mut TagReference> {
        self.maps.iter_mut().collect()
    }

    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        self.shader_type = ShaderType::from_class(self.class).unwrap_or_default();
        let engine = workload.engine();

        match &mut self.body {
            ShaderBody::Environment {
                bump_map_scale,
                bump_map_scale_x,
                bump_map_scale_y,
                material_color,
            } => {
                *bump_map_scale_x = *bump_map_scale;
                *bump_map_scale_y = *bump_map_scale;
                if material_color.red == 0.0
                    && material_color.green == 0.0
                    && material_color.blue == 0.0
                {
                    *material_color = ColorRgb {
                        red: 1.0,
                        green: 1.0,
                        blue: 1.0,
                    };
                }
            }
            ShaderBody::Model {
                reflection_cutoff_distance,
                reflection_falloff_distance,
                unknown,
            } => {
                *unknown = 1.0;
                if *reflection_falloff_distance >= *reflection_cutoff_distance
                    && *reflection_cutoff_distance != 0.0
                    && *reflection_falloff_distance != 0.0
                {
                    workload.warn_pedantic(
                        tag_index,
                        format!(
                            "reflection falloff is greater than or equal to cutoff, so both were set to 0 ({reflection_falloff_distance} >= {reflection_cutoff_distance})"
                        ),
                    );
                    *reflection_cutoff_distance = 0.0;
                    *reflection_falloff_distance = 0.0;
                }
            }
            ShaderBody::Other => {}
        }

        if self.class == TagClass::ShaderTransparentChicagoExtended
            && engine == CacheFileEngine::Xbox
        {
            return Err(BuildError::UnsupportedEngine {
                engine,
                what: String::from("shader_transparent_chicago_extended tags"),
            }
            .into());
        }
        if self.class == TagClass::ShaderTransparentGeneric
            && matches!(
                engine,
                CacheFileEngine::Demo | CacheFileEngine::Retail | CacheFileEngine::CustomEdition
            )
        {
            workload.warn(
                tag_index,
                String::from("shader_transparent_generic tags will not render on the target engine"),
            );
        }
        Ok(())
    }

    /// Engine layout: 8 base bytes, the class body, then the maps block.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u16(self.shader_type as u16)?;
        emitter.write_u16(self.flags)?;
        emitter.write_f32(self.power)?;
        match &self.body {
            ShaderBody::Environment {
                bump_map_scale,
                bump_map_scale_x,
                bump_map_scale_y,
                material_color,
            } => {
                emitter.write_f32(*bump_map_scale)?;
                emitter.write_f32(*bump_map_scale_x)?;
                emitter.write_f32(*bump_map_scale_y)?;
                emitter.write_f32(material_color.red)?;
                emitter.write_f32(material_color.green)?;
                emitter.write_f32(material_color.blue)?;
            }
            ShaderBody::Model {
                reflection_cutoff_distance,
                reflection_falloff_distance,
                unknown,
            } => {
                emitter.write_f32(*reflection_cutoff_distance)?;
                emitter.write_f32(*reflection_falloff_distance)?;
                emitter.write_f32(*unknown)?;
            }
            ShaderBody::Other => {}
        }
        let maps_stub = emitter.reserve_block()?;
        emitter.commit_block(maps_stub, self.maps.len())?;
        for map in &self.maps {
            emitter.write_reference(map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildParameters, BuildWorkload};
    use std::io::Cursor;

    fn workload_for(engine: CacheFileEngine) -> BuildWorkload {
        BuildWorkload::new(BuildParameters {
            engine,
            ..BuildParameters::default()
        })
    }

    #[test]
    fn environment_defaults_black_material_to_white() {
        let mut shader = Shader {
            class: TagClass::ShaderEnvironment,
            shader_type: ShaderType::default(),
            flags: 0,
            power: 0.0,
            body: ShaderBody::Environment {
                bump_map_scale: 2.5,
                bump_map_scale_x: 0.0,
                bump_map_scale_y: 0.0,
                material_color: ColorRgb::default(),
            },
            maps: Vec::new(),
        };
        let mut workload = workload_for(CacheFileEngine::DarkCirclet);
        shader.pre_compile(&mut workload, 0).unwrap();

        assert_eq!(shader.shader_type, ShaderType::Environment);
        match shader.body {
            ShaderBody::Environment {
                bump_map_scale_x,
                bump_map_scale_y,
                material_color,
                ..
            } => {
                assert_eq!(bump_map_scale_x, 2.5);
                assert_eq!(bump_map_scale_y, 2.5);
                assert_eq!(material_color.red, 1.0);
                assert_eq!(material_color.blue, 1.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn model_reflection_falloff_at_or_past_cutoff_zeroes_both() {
        let mut shader = Shader {
            class: TagClass::ShaderModel,
            shader_type: ShaderType::default(),
            flags: 0,
            power: 0.0,
            body: ShaderBody::Model {
                reflection_cutoff_distance: 1.0,
                reflection_falloff_distance: 5.0,
                unknown: 0.0,
            },
            maps: Vec::new(),
        };
        let mut workload = workload_for(CacheFileEngine::DarkCirclet);
        shader.pre_compile(&mut workload, 0).unwrap();

        match shader.body {
            ShaderBody::Model {
                reflection_cutoff_distance,
                reflection_falloff_distance,
                unknown,
            } => {
                assert_eq!(reflection_cutoff_distance, 0.0);
                assert_eq!(reflection_falloff_distance, 0.0);
                assert_eq!(unknown, 1.0);
            }
            _ => unreachable!(),
        }
        assert_eq!(workload.reports().len(), 1);
    }

    #[test]
    fn chicago_extended_is_rejected_on_xbox() {
        let mut shader = Shader {
            class: TagClass::ShaderTransparentChicagoExtended,
            shader_type: ShaderType::default(),
            flags: 0,
            power: 0.0,
            body: ShaderBody::Other,
            maps: Vec::new(),
        };
        let mut workload = workload_for(CacheFileEngine::Xbox);
        assert!(shader.pre_compile(&mut workload, 0).is_err());
    }

    #[test]
    fn transparent_generic_warns_on_pc_targets() {
        let mut shader = Shader {
            class: TagClass::ShaderTransparentGeneric,
            shader_type: ShaderType::default(),
            flags: 0,
            power: 0.0,
            body: ShaderBody::Other,
            maps: Vec::new(),
        };
        let mut workload = workload_for(CacheFileEngine::Retail);
        shader.pre_compile(&mut workload, 0).unwrap();
        assert_eq!(workload.reports().len(), 1);

        let mut workload = workload_for(CacheFileEngine::DarkCirclet);
        shader.pre_compile(&mut workload, 0).unwrap();
        assert!(workload.reports().is_empty());
    }

    #[test]
    fn source_form_round_trips() {
        let shader = Shader {
            class: TagClass::ShaderEnvironment,
            shader_type: ShaderType::default(),
            flags: 3,
            power: 0.5,
            body: ShaderBody::Environment {
                bump_map_scale: 1.0,
                bump_map_scale_x: 0.0,
                bump_map_scale_y: 0.0,
                material_color: ColorRgb {
                    red: 0.25,
                    green: 0.5,
                    blue: 0.75,
                },
            },
            maps: vec![TagReference::new(
                TagClass::Bitmap,
                r"levels\test\bitmaps\ground",
            )],
        };
        let mut buffer = Vec::new();
        shader.write(&mut buffer).unwrap();
        let read = Shader::read(TagClass::ShaderEnvironment, &mut Cursor::new(buffer.as_slice()))
            .unwrap();
        assert_eq!(read.flags, 3);
        assert_eq!(read.body, shader.body);
        assert_eq!(read.maps[0].path, r"levels\test\bitmaps\ground");
    }
}
