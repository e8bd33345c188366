//! HTTP handlers: parse `(resource, file)` out of the request path, route it
//! through the admission layer and map the error taxonomy onto status codes.
//!
//! Mapping per the error design: `NotFound` → 404, `EmptyImage` /
//! `EmptyDebugMask` → 404 with a canonical empty body, `Unavailable` → 503,
//! `Cancelled` → 204 (the client is gone anyway), everything else → 500.

use super::admission::{Admission, RequestFingerprint};
use super::wmts;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use cartolina_core::{FileClass, ImageFormat, TileCoord, TileError};
use cartolina_generators::{ArtifactKind, GeneratorRegistry, ResourceId, TileRequest};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
	static ref TILE_FILE: Regex =
		Regex::new(r"^(\d+)-(\d+)-(\d+)\.(jpg|jpeg|png|webp|mask|meta|terrain|nav|geo|normals)$").unwrap();
}

#[derive(Clone)]
pub struct AppState {
	pub registry: Arc<GeneratorRegistry>,
	pub admission: Admission,
}

#[derive(Debug, Default, Deserialize)]
pub struct TileQuery {
	/// Debug flavour: do not optimise empty tiles away.
	#[serde(default)]
	debug: Option<String>,
	/// Cache-busting revision tags; not interpreted.
	#[serde(default)]
	gr: Option<String>,
	#[serde(default)]
	r: Option<String>,
}

pub async fn serve(
	State(state): State<AppState>,
	Path((reference_frame, full_id, file)): Path<(String, String, String)>,
	Query(query): Query<TileQuery>,
) -> Response<Body> {
	let _ = (&query.gr, &query.r);

	let Some((group, id)) = full_id.split_once('-') else {
		return error_response(StatusCode::NOT_FOUND, "Not Found");
	};
	let resource_id = ResourceId::new(&reference_frame, group, id);

	let generator = match state.registry.generator(&resource_id) {
		None => return error_response(StatusCode::NOT_FOUND, "Not Found"),
		Some(Err(_)) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "Resource is not ready yet"),
		Some(Ok(generator)) => generator,
	};

	// configuration documents
	match file.as_str() {
		"mapconfig.json" => {
			return json_response(&generator.mapconfig(), generator.resource().file_class_settings.max_age(FileClass::Config));
		}
		"boundlayer.json" => {
			return match generator.boundlayer() {
				Some(doc) => json_response(&doc, generator.resource().file_class_settings.max_age(FileClass::Config)),
				None => error_response(StatusCode::NOT_FOUND, "Not Found"),
			};
		}
		"freelayer.json" => {
			let mapconfig = generator.mapconfig();
			let layer = &mapconfig["freeLayers"][generator.resource().full_id()];
			return if layer.is_null() {
				error_response(StatusCode::NOT_FOUND, "Not Found")
			} else {
				json_response(layer, generator.resource().file_class_settings.max_age(FileClass::Config))
			};
		}
		"capabilities.xml" => {
			return match wmts::capabilities(generator.as_ref()) {
				Some(xml) => xml_response(&xml, generator.resource().file_class_settings.max_age(FileClass::Config)),
				None => error_response(StatusCode::NOT_FOUND, "Not Found"),
			};
		}
		_ => {}
	}

	// tile artifacts
	let Some(request) = parse_tile_file(&file, query.debug.is_some()) else {
		return error_response(StatusCode::NOT_FOUND, "Not Found");
	};

	let fingerprint = RequestFingerprint {
		resource: resource_id,
		interface: generator.resource().gen.kind.interface(),
		request,
	};
	match state.admission.get_or_build(fingerprint, generator).await {
		Ok(artifact) => {
			let cache_control = if artifact.max_age < 0 {
				String::from("no-cache")
			} else {
				format!("max-age={}", artifact.max_age)
			};
			Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, artifact.content_type)
				.header(header::CACHE_CONTROL, cache_control)
				.body(Body::from(artifact.body.into_vec()))
				.expect("building a tile response cannot fail")
		}
		Err(err) => match TileError::of(err.as_ref()) {
			Some(TileError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Not Found"),
			Some(TileError::EmptyImage | TileError::EmptyDebugMask) => {
				// canonical empty body for logical "no data here"
				Response::builder()
					.status(StatusCode::NOT_FOUND)
					.header(header::CONTENT_TYPE, "application/octet-stream")
					.body(Body::empty())
					.expect("building an empty response cannot fail")
			}
			Some(TileError::Unavailable(_)) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Resource is not ready yet"),
			Some(TileError::Cancelled) => Response::builder()
				.status(StatusCode::NO_CONTENT)
				.body(Body::empty())
				.expect("building an empty response cannot fail"),
			_ => {
				log::warn!("request failed: {:#}", err.as_ref());
				error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
			}
		},
	}
}

/// Maps a tile file name onto the producer request.
pub fn parse_tile_file(file: &str, debug: bool) -> Option<TileRequest> {
	let captures = TILE_FILE.captures(file)?;
	let lod: u8 = captures[1].parse().ok()?;
	let x: u32 = captures[2].parse().ok()?;
	let y: u32 = captures[3].parse().ok()?;
	let coord = TileCoord::new(lod, x, y).ok()?;

	let kind = match &captures[4] {
		"jpg" | "jpeg" => ArtifactKind::Image(ImageFormat::Jpeg),
		"png" => ArtifactKind::Image(ImageFormat::Png),
		"webp" => ArtifactKind::Image(ImageFormat::Webp),
		"mask" => ArtifactKind::Mask,
		"meta" => ArtifactKind::Metatile,
		"terrain" => ArtifactKind::Mesh,
		"nav" => ArtifactKind::Navtile,
		"geo" => ArtifactKind::Geodata,
		"normals" => ArtifactKind::Normals,
		_ => return None,
	};
	Some(TileRequest { coord, kind, debug })
}

/// Listing of the served resources, used by the browser index page.
pub async fn list_resources(State(state): State<AppState>) -> Response<Body> {
	let listing: HashMap<String, String> = state
		.registry
		.list()
		.into_iter()
		.map(|info| (info.id.to_string(), format!("{:?}", info.state)))
		.collect();
	json_response(&serde_json::to_value(listing).unwrap_or_default(), -1)
}

fn json_response(value: &serde_json::Value, max_age: i64) -> Response<Body> {
	let cache_control = if max_age < 0 {
		String::from("no-cache")
	} else {
		format!("max-age={max_age}")
	};
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/json; charset=utf-8")
		.header(header::CACHE_CONTROL, cache_control)
		.body(Body::from(value.to_string()))
		.expect("building a JSON response cannot fail")
}

fn xml_response(xml: &str, max_age: i64) -> Response<Body> {
	let cache_control = if max_age < 0 {
		String::from("no-cache")
	} else {
		format!("max-age={max_age}")
	};
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/xml")
		.header(header::CACHE_CONTROL, cache_control)
		.body(Body::from(xml.to_string()))
		.expect("building an XML response cannot fail")
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(message.to_string()))
		.expect("building an error response cannot fail")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tile_file_parsing() {
		let request = parse_tile_file("10-5-6.jpg", false).unwrap();
		assert_eq!(request.coord, TileCoord::new(10, 5, 6).unwrap());
		assert_eq!(request.kind, ArtifactKind::Image(ImageFormat::Jpeg));
		assert!(!request.debug);

		assert_eq!(parse_tile_file("3-1-1.terrain", false).unwrap().kind, ArtifactKind::Mesh);
		assert_eq!(parse_tile_file("3-1-1.mask", true).unwrap().kind, ArtifactKind::Mask);
		assert_eq!(parse_tile_file("8-0-0.meta", false).unwrap().kind, ArtifactKind::Metatile);
		assert_eq!(parse_tile_file("8-0-0.nav", false).unwrap().kind, ArtifactKind::Navtile);
		assert_eq!(parse_tile_file("8-0-0.geo", false).unwrap().kind, ArtifactKind::Geodata);

		assert!(parse_tile_file("mapconfig.json", false).is_none());
		assert!(parse_tile_file("10-5.jpg", false).is_none());
		assert!(parse_tile_file("10-5-6.gif", false).is_none());
		// lod out of the addressable tree
		assert!(parse_tile_file("99-0-0.jpg", false).is_none());
	}
}
