//! 通用工具函数

use rand::Rng;
use sha2::{Digest, Sha256};

/// 公开访问密钥长度
pub const SECRET_KEY_LENGTH: usize = 128;

/// 可生成缩略图的影像扩展名
const THUMBNAIL_EXTENSIONS: [&str; 3] = ["jpg", "png", "bmp"];

/// 生成由小写字母组成的随机密钥
pub fn generate_secret_key(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// 密钥摘要（SHA-256 十六进制），数据库只保存摘要
pub fn digest_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 去掉电话号码中的空格、短横线和括号
pub fn normalize_phone_number(number: &str) -> String {
    number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect()
}

/// 10位号码格式化为 `(xxx) xxx-xxxx`
pub fn format_phone_number(number: &str) -> String {
    let digits = normalize_phone_number(number);
    if digits.len() != 10 || !digits.is_ascii() {
        return digits;
    }
    format!("({}) {}-{}", &digits[0..3], &digits[3..6], &digits[6..10])
}

/// 是否为可直接展示的缩略图文件
pub fn is_thumbnail(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| {
            THUMBNAIL_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

/// 去掉HTML标签，`<br>` 转为换行
pub fn strip_tags(html: &str) -> String {
    let html = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");

    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text
}
