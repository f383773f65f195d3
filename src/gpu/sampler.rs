// gpu/sampler.rs — Fixed sampler presets.
//
// Four address/filter combinations cover every sampling pattern the
// reconstruction needs:
//
//   Nearest            no addressing     + nearest
//   Linear             no addressing     + linear
//   LinearClampToEdge  clamp to edge     + linear
//   LinearClampToBorder clamp to border  + linear (zero outside)
//
// wgpu has no "no addressing" mode; clamp-to-edge is the closest match and
// is what callers get for the first two. Border clamping needs
// `Features::ADDRESS_MODE_CLAMP_TO_BORDER`; without it the border preset
// degrades to clamp-to-edge and `border_supported()` reports false.
//
// Linear filtering of R32Float textures additionally needs
// `Features::FLOAT32_FILTERABLE`. The solver's kernels never sample through
// these presets (they use `textureLoad` with explicit bilinear weights so the
// backprojection is the exact adjoint of the host projector); the presets
// serve external collaborators that want fixed-function sampling.

/// One of the fixed sampler configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerPreset {
    Nearest,
    Linear,
    LinearClampToEdge,
    LinearClampToBorder,
}

impl SamplerPreset {
    pub const ALL: [SamplerPreset; 4] = [
        SamplerPreset::Nearest,
        SamplerPreset::Linear,
        SamplerPreset::LinearClampToEdge,
        SamplerPreset::LinearClampToBorder,
    ];

    /// Address and filter modes for this preset, given whether border
    /// clamping is available.
    fn modes(self, border: bool) -> (wgpu::AddressMode, wgpu::FilterMode) {
        use wgpu::{AddressMode, FilterMode};
        match self {
            SamplerPreset::Nearest => (AddressMode::ClampToEdge, FilterMode::Nearest),
            SamplerPreset::Linear | SamplerPreset::LinearClampToEdge => {
                (AddressMode::ClampToEdge, FilterMode::Linear)
            }
            SamplerPreset::LinearClampToBorder if border => {
                (AddressMode::ClampToBorder, FilterMode::Linear)
            }
            SamplerPreset::LinearClampToBorder => (AddressMode::ClampToEdge, FilterMode::Linear),
        }
    }

    fn label(self) -> &'static str {
        match self {
            SamplerPreset::Nearest => "sampler nearest",
            SamplerPreset::Linear => "sampler linear",
            SamplerPreset::LinearClampToEdge => "sampler linear clamp-to-edge",
            SamplerPreset::LinearClampToBorder => "sampler linear clamp-to-border",
        }
    }
}

/// All presets, created once per device.
pub(crate) struct SamplerSet {
    samplers: [wgpu::Sampler; 4],
    border: bool,
}

impl SamplerSet {
    pub(crate) fn new(device: &wgpu::Device, features: wgpu::Features) -> Self {
        let border = features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        if !border {
            tracing::debug!("clamp-to-border unavailable, border preset uses clamp-to-edge");
        }
        let samplers = SamplerPreset::ALL.map(|preset| {
            let (address, filter) = preset.modes(border);
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(preset.label()),
                address_mode_u: address,
                address_mode_v: address,
                address_mode_w: address,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                border_color: (address == wgpu::AddressMode::ClampToBorder)
                    .then_some(wgpu::SamplerBorderColor::TransparentBlack),
                ..Default::default()
            })
        });
        SamplerSet { samplers, border }
    }

    pub(crate) fn get(&self, preset: SamplerPreset) -> &wgpu::Sampler {
        let idx = SamplerPreset::ALL
            .iter()
            .position(|&p| p == preset)
            .unwrap_or(0);
        &self.samplers[idx]
    }

    pub(crate) fn border_supported(&self) -> bool {
        self.border
    }
}
