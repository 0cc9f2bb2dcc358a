//! User-facing HTML fragments for error and redirect responses

use crate::http::status_description;
use crate::util::escape_html;

pub const ERROR_UNDEFINED: &str = "Detailed error description is not available.";

pub const ERROR_403_BROWSE_CONTENT: &str =
    "This virtual directory does not allow contents to be listed.";

pub const ERROR_403_ACCESS_DENIED: &str = "Access to filesystem object is denied.";

pub const ERROR_406_CHARSET_NOT_ALLOWED: &str =
    "The response's content charset is not allowed by client";

pub const ERROR_500_REQUEST_NOT_LOADED: &str = "HTTP request was not loaded correctly";

pub const ERROR_503_OVERLOADED: &str = "The server is currently unable to handle the request \
     due to a temporary overloading or maintenance of the server.";

pub const SERVER_ERROR_FILE_INSTEAD_DIRECTORY: &str =
    "File path retrieved instead of directory";

pub fn document_moved(location: &str) -> String {
    format!("This document may be found <a href=\"{location}\">here</a>")
}

pub fn not_found(virtual_path: &str) -> String {
    format!("The requested page cannot be found: \"{}\"", escape_html(virtual_path))
}

pub fn method_not_allowed(method: &str, allowed: &str) -> String {
    format!(
        "The requested HTTP method is not allowed for the resource: {}.<br /> Allowed methods: {}.",
        escape_html(method),
        allowed
    )
}

pub fn method_not_implemented(method: &str) -> String {
    format!(
        "Requested method ({}) is not implemented, try GET/POST/HEAD.",
        escape_html(method)
    )
}

pub fn internal_error(message: &str) -> String {
    format!("Internal server error.<hr />{}", escape_html(message))
}

/// Boxed error page carrying the status description as the title.
pub fn error_page(status: u16, description: &str) -> String {
    let status_desc = status_description(status);
    let description = if description.is_empty() { ERROR_UNDEFINED } else { description };
    format!(
        "<html><head><title>{status_desc}</title> \
         <style> BODY {{ padding: 10px; margin: 10px; font: 10pt Tahoma, Arial; color: #000;}} \
         H1 {{color: #cc0000; font: 14pt Tahoma, Arial; font-weight: bold; }} \
         HR {{height:1px; border: 1px solid #333; color: #333;}} \
         TABLE {{font-size: 100%;}}</style> \
         </head><body><h1>{status_desc}</h1>{description}</body></html>"
    )
}

/// Fragment appended to an already-started body when an error occurs
/// after the headers left the socket.
pub fn error_fragment_inline(status: u16, message: &str) -> String {
    format!(
        "<hr /><b style=\"color:#cc0000;\">{}</b><br/>{}",
        status_description(status),
        escape_html(message)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_page_carries_status_and_text() {
        let page = error_page(404, "missing");
        assert!(page.contains("<title>404 Not Found</title>"));
        assert!(page.contains("<h1>404 Not Found</h1>"));
        assert!(page.contains("missing"));
    }

    #[test]
    fn test_error_page_empty_description_falls_back() {
        let page = error_page(500, "");
        assert!(page.contains(ERROR_UNDEFINED));
    }

    #[test]
    fn test_not_found_escapes_path() {
        let body = not_found("/<script>");
        assert!(body.contains("&lt;script&gt;"));
    }
}
