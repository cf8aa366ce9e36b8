/// Zoom steps are logarithmic with base 1.2: `scale = 1.2 ^ (defaultZoom - zoom)`.
const ZOOM_LOG_BASE: f64 = 1.2;

/// Context needed to recover the zoom level implied by a tile geometry message.
#[derive(Debug, Clone, Copy)]
pub struct ZoomContext {
    /// Reference tile width in twips at the default zoom.
    pub tile_width_twips: f64,
    pub default_zoom: i32,
}

/// A structured key/value record derived from one server command line.
///
/// Unknown tokens are ignored for forward compatibility, and malformed numeric
/// tokens leave their field unset rather than failing the whole parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerCommand {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub tile_width: Option<i64>,
    pub tile_height: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub part: Option<i64>,
    pub parts: Option<i64>,
    pub selected_part: Option<i64>,
    pub mode: Option<i64>,
    pub zoom: Option<i32>,
    pub rendercount: Option<i64>,
    pub id: Option<String>,
    pub doc_type: Option<String>,
    pub error_cmd: Option<String>,
    pub error_code: Option<String>,
    pub error_kind: Option<String>,
    pub jail: Option<String>,
    pub dir: Option<String>,
    pub name: Option<String>,
    pub port: Option<String>,
    pub font: Option<String>,
    pub char_code: Option<String>,
    pub view_id: Option<String>,
    pub n_view_id: Option<String>,
    pub render_id: Option<String>,
    pub wire_id: Option<String>,
    pub title: Option<String>,
    pub dialog_width: Option<i64>,
    pub dialog_height: Option<i64>,
    pub rectangle: Option<String>,
    pub username: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub params: Vec<String>,
    pub hidden_parts: Vec<i64>,
    pub selected_parts: Vec<i64>,
    pub page_rectangles: Vec<String>,
}

impl ServerCommand {
    /// Tokenize a command line without zoom derivation.
    pub fn parse(msg: &str) -> Self {
        Self::parse_with(msg, None)
    }

    /// Tokenize a command line; when both `tilewidth=` and a reference tile
    /// width are known, derive the zoom level the geometry implies.
    pub fn parse_with(msg: &str, zoom_ctx: Option<ZoomContext>) -> Self {
        let mut command = ServerCommand::default();

        for token in msg.split(|c: char| c == ' ' || c == '\n').filter(|t| !t.is_empty()) {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "tileposx" | "x" => command.x = parse_int(value),
                "tileposy" | "y" => command.y = parse_int(value),
                "tilewidth" => command.tile_width = parse_int(value),
                "tileheight" => command.tile_height = parse_int(value),
                "width" => command.width = parse_int(value),
                "height" => command.height = parse_int(value),
                "part" => command.part = parse_int(value),
                "parts" => command.parts = parse_int(value),
                "current" => command.selected_part = parse_int(value),
                "mode" => command.mode = parse_int(value),
                "rendercount" => command.rendercount = parse_int(value),
                "id" => command.id = Some(strip_newlines(value)),
                "type" => command.doc_type = Some(strip_newlines(value)),
                "cmd" => command.error_cmd = Some(value.to_string()),
                "code" => command.error_code = Some(value.to_string()),
                "kind" => command.error_kind = Some(value.to_string()),
                "jail" => command.jail = Some(value.to_string()),
                "dir" => command.dir = Some(value.to_string()),
                "name" => command.name = Some(value.to_string()),
                "port" => command.port = Some(value.to_string()),
                "font" => command.font = Some(value.to_string()),
                "char" => command.char_code = Some(value.to_string()),
                "viewid" => command.view_id = Some(value.to_string()),
                "nviewid" => command.n_view_id = Some(value.to_string()),
                "renderid" => command.render_id = Some(value.to_string()),
                "wid" => command.wire_id = Some(value.to_string()),
                "title" => command.title = Some(value.to_string()),
                "dialogwidth" => command.dialog_width = parse_int(value),
                "dialogheight" => command.dialog_height = parse_int(value),
                "rectangle" => command.rectangle = Some(value.to_string()),
                "username" => command.username = Some(value.to_string()),
                "filename" => command.filename = Some(value.to_string()),
                "url" => command.url = Some(value.to_string()),
                "params" => command.params = parse_string_list(value),
                "hiddenparts" => command.hidden_parts = parse_int_list(value),
                "selectedparts" => command.selected_parts = parse_int_list(value),
                "pagerectangles" => command.page_rectangles = parse_rect_list(value),
                _ => {} // unknown tokens are ignored
            }
        }

        if let (Some(tile_width), Some(ctx)) = (command.tile_width, zoom_ctx) {
            if ctx.tile_width_twips > 0.0 && tile_width > 0 {
                // scale = 1.2 ^ (defaultZoom - zoom)
                // zoom = defaultZoom - log(scale) / log(1.2)
                let scale = tile_width as f64 / ctx.tile_width_twips;
                let zoom = ctx.default_zoom as f64 - scale.ln() / ZOOM_LOG_BASE.ln();
                command.zoom = Some(zoom.round() as i32);
            }
        }

        command
    }
}

fn parse_int(value: &str) -> Option<i64> {
    value.trim_end_matches(['\r', '\n']).parse().ok()
}

fn strip_newlines(value: &str) -> String {
    value.replace(['\r', '\n'], "")
}

fn parse_string_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_int_list(value: &str) -> Vec<i64> {
    value
        .split([',', ';'])
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn parse_rect_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
