//! Tag class registry: four-cc codes, parent chains, on-disk extensions.

use num_enum::TryFromPrimitive;

/// Four-cc slot reading `0xFFFFFFFF` when a class has no parent at that
/// depth.
pub const NULL_FOURCC: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
/// Known tag classes, discriminated by their big-endian-ASCII four-cc.
///
/// Classes form a shallow hierarchy: a reference typed as a parent class
/// accepts any descendant during resolution.
pub enum TagClass {
    /// `bitm`
    Bitmap = 0x6269_746D,
    /// `mod2`, the GBX model variant
    GbxModel = 0x6D6F_6432,
    /// `obje`
    Object = 0x6F62_6A65,
    /// `scen`
    Scenery = 0x7363_656E,
    /// `scnr`
    Scenario = 0x7363_6E72,
    /// `sbsp`
    ScenarioStructureBsp = 0x7362_7370,
    /// `shdr`
    Shader = 0x7368_6472,
    /// `senv`
    ShaderEnvironment = 0x7365_6E76,
    /// `soso`
    ShaderModel = 0x736F_736F,
    /// `schi`
    ShaderTransparentChicago = 0x7363_6869,
    /// `scex`
    ShaderTransparentChicagoExtended = 0x7363_6578,
    /// `sotr`
    ShaderTransparentGeneric = 0x736F_7472,
    /// `sgla`
    ShaderTransparentGlass = 0x7367_6C61,
    /// `smet`
    ShaderTransparentMeter = 0x736D_6574,
    /// `spla`
    ShaderTransparentPlasma = 0x7370_6C61,
    /// `swat`
    ShaderTransparentWater = 0x7377_6174,
    /// `sky `
    Sky = 0x736B_7920,
    /// `snd!`
    Sound = 0x736E_6421,
    /// `ustr`
    UnicodeStringList = 0x7573_7472,
}

impl TagClass {
    /// The class four-cc as stored in tag records.
    pub fn fourcc(self) -> u32 {
        self as u32
    }

    /// Parent class, if any.
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Scenery => Some(Self::Object),
            Self::ShaderEnvironment
            | Self::ShaderModel
            | Self::ShaderTransparentChicago
            | Self::ShaderTransparentChicagoExtended
            | Self::ShaderTransparentGeneric
            | Self::ShaderTransparentGlass
            | Self::ShaderTransparentMeter
            | Self::ShaderTransparentPlasma
            | Self::ShaderTransparentWater => Some(Self::Shader),
            _ => None,
        }
    }

    /// Primary, secondary, and tertiary four-ccs for a tag record, with
    /// absent levels reading [`NULL_FOURCC`].
    pub fn chain(self) -> (u32, u32, u32) {
        let secondary = self.parent();
        let tertiary = secondary.and_then(Self::parent);
        (
            self.fourcc(),
            secondary.map_or(NULL_FOURCC, Self::fourcc),
            tertiary.map_or(NULL_FOURCC, Self::fourcc),
        )
    }

    /// True when this class satisfies a reference typed as `expected`.
    pub fn matches(self, expected: Self) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == expected {
                return true;
            }
            current = class.parent();
        }
        false
    }

    /// On-disk file extension for tags of this class.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bitmap => "bitmap",
            Self::GbxModel => "gbxmodel",
            Self::Object => "object",
            Self::Scenery => "scenery",
            Self::Scenario => "scenario",
            Self::ScenarioStructureBsp => "scenario_structure_bsp",
            Self::Shader => "shader",
            Self::ShaderEnvironment => "shader_environment",
            Self::ShaderModel => "shader_model",
            Self::ShaderTransparentChicago => "shader_transparent_chicago",
            Self::ShaderTransparentChicagoExtended => "shader_transparent_chicago_extended",
            Self::ShaderTransparentGeneric => "shader_transparent_generic",
            Self::ShaderTransparentGlass => "shader_transparent_glass",
            Self::ShaderTransparentMeter => "shader_transparent_meter",
            Self::ShaderTransparentPlasma => "shader_transparent_plasma",
            Self::ShaderTransparentWater => "shader_transparent_water",
            Self::Sky => "sky",
            Self::Sound => "sound",
            Self::UnicodeStringList => "unicode_string_list",
        }
    }
}
