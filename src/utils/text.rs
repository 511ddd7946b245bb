/// 按字符截断文本，超出时追加省略号
pub fn sub(text: &str, max_chars: usize, ellipsis: bool) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut out = text[..cut].to_string();
            if ellipsis {
                out.push_str("...");
            }
            out
        }
        None => text.to_string(),
    }
}
