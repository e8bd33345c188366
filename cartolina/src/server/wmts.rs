//! Minimal WMTS capabilities document. Only resources with a bound-layer
//! surface (raster and gdaldem drivers) are advertised; normal and specular
//! maps have no WMTS wiring and are deliberately left out.

use cartolina_generators::Generator;

pub fn capabilities(generator: &dyn Generator) -> Option<String> {
	let boundlayer = generator.boundlayer()?;
	let url = boundlayer["url"].as_str()?.replace("{lod}", "{TileMatrix}")
		.replace("{x}", "{TileCol}")
		.replace("{y}", "{TileRow}");
	let resource = generator.resource();

	Some(format!(
		r#"<?xml version="1.0" encoding="UTF-8"?>
<Capabilities xmlns="http://www.opengis.net/wmts/1.0" version="1.0.0">
  <Contents>
    <Layer>
      <ows:Identifier xmlns:ows="http://www.opengis.net/ows/1.1">{id}</ows:Identifier>
      <Style isDefault="true"><ows:Identifier xmlns:ows="http://www.opengis.net/ows/1.1">default</ows:Identifier></Style>
      <TileMatrixSetLink><TileMatrixSet>{frame}</TileMatrixSet></TileMatrixSetLink>
      <ResourceURL format="image/png" resourceType="tile" template="{url}"/>
    </Layer>
  </Contents>
</Capabilities>
"#,
		id = resource.full_id(),
		frame = resource.id.reference_frame,
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use cartolina_core::Sink;
	use cartolina_generators::{Resource, TileArtifact, TileRequest};

	struct FakeGenerator {
		resource: Resource,
		boundlayer: Option<serde_json::Value>,
	}

	#[async_trait]
	impl Generator for FakeGenerator {
		fn resource(&self) -> &Resource {
			&self.resource
		}
		async fn prepare(&self, _sink: &Sink) -> anyhow::Result<()> {
			Ok(())
		}
		async fn generate(&self, _request: &TileRequest, _sink: &Sink) -> anyhow::Result<TileArtifact> {
			unreachable!()
		}
		fn url_template(&self) -> String {
			String::new()
		}
		fn boundlayer(&self) -> Option<serde_json::Value> {
			self.boundlayer.clone()
		}
		fn mapconfig(&self) -> serde_json::Value {
			serde_json::Value::Null
		}
	}

	fn fake(boundlayer: Option<serde_json::Value>) -> FakeGenerator {
		FakeGenerator {
			resource: Resource {
				id: cartolina_generators::ResourceId::new("webmercator", "g", "a"),
				gen: cartolina_generators::GeneratorRef::new(cartolina_generators::GeneratorKind::Tms, "tms-raster"),
				revision: 0,
				lod_range: cartolina_core::LodRange::new(0, 4).unwrap(),
				tile_range: cartolina_core::TileRange::empty(),
				credits: Default::default(),
				registry: Default::default(),
				file_class_settings: Default::default(),
				comment: String::new(),
				definition: std::sync::Arc::new(cartolina_generators::resource::definitions::TmsRasterDef::default()),
			},
			boundlayer,
		}
	}

	#[test]
	fn advertises_bound_layers_only() {
		let with_layer = fake(Some(serde_json::json!({"url": "g/a/{lod}-{x}-{y}.png?gr=1&r=0"})));
		let xml = capabilities(&with_layer).unwrap();
		assert!(xml.contains("<ows:Identifier"));
		assert!(xml.contains("{TileMatrix}-{TileCol}-{TileRow}.png"));
		assert!(xml.contains("g-a"));

		let without = fake(None);
		assert!(capabilities(&without).is_none());
	}
}
