use super::*;
use std::io::{Cursor, Write};
use tempfile::NamedTempFile;

const SPACE: usize = 259;
const HE: usize = 264;
const LL: usize = 265;
const HELLO: usize = 267;
const SPACE_HELLO: usize = 268;
const E_ACUTE: usize = 269;

fn serialize_vocab(entries: &[(&[u8], f32)]) -> Vec<u8> {
    let max_len = entries.iter().map(|(bytes, _)| bytes.len()).max().unwrap_or(0);

    let mut data = Vec::new();
    data.extend_from_slice(&(max_len as i32).to_le_bytes());
    for (bytes, score) in entries {
        data.extend_from_slice(&score.to_le_bytes());
        data.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
        data.extend_from_slice(bytes);
    }
    data
}

/// Special tokens, 256 byte tokens, then a handful of words.
fn test_vocab() -> Vec<(Vec<u8>, f32)> {
    let mut entries: Vec<(Vec<u8>, f32)> =
        vec![(b"<unk>".to_vec(), 0.0), (b"<s>".to_vec(), 0.0), (b"</s>".to_vec(), 0.0)];
    entries.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>").into_bytes(), 0.0)));
    entries.extend([
        (b" ".to_vec(), -1.0),
        (b"h".to_vec(), -2.0),
        (b"e".to_vec(), -2.0),
        (b"l".to_vec(), -2.0),
        (b"o".to_vec(), -2.0),
        (b"he".to_vec(), 1.0),
        (b"ll".to_vec(), 2.0),
        (b"llo".to_vec(), 3.0),
        (b"hello".to_vec(), 4.0),
        (b" hello".to_vec(), 5.0),
        ("é".as_bytes().to_vec(), -3.0),
    ]);
    entries
}

fn test_tokenizer() -> Tokenizer {
    let entries = test_vocab();
    let borrowed: Vec<(&[u8], f32)> = entries.iter().map(|(b, s)| (b.as_slice(), *s)).collect();
    Tokenizer::from_reader(Cursor::new(serialize_vocab(&borrowed)), entries.len()).unwrap()
}

fn decode_all(tokenizer: &Tokenizer, tokens: &[usize]) -> Vec<u8> {
    let mut out = Vec::new();
    for pair in tokens.windows(2) {
        out.extend_from_slice(tokenizer.decode(pair[0], pair[1]));
    }
    out
}

#[test]
fn test_load_and_lookup() {
    let tokenizer = test_tokenizer();

    assert_eq!(tokenizer.vocab_size(), 270);
    assert_eq!(tokenizer.max_token_length(), 6);
    assert_eq!(tokenizer.str_lookup(b" "), Some(SPACE));
    assert_eq!(tokenizer.str_lookup(b"hello"), Some(HELLO));
    assert_eq!(tokenizer.str_lookup(b"<0x41>"), Some(0x41 + BYTE_FALLBACK_OFFSET));
    assert_eq!(tokenizer.str_lookup(b"missing"), None);
    assert_eq!(tokenizer.score(LL), Some(2.0));
}

#[test]
fn test_load_from_file() {
    let entries = test_vocab();
    let borrowed: Vec<(&[u8], f32)> = entries.iter().map(|(b, s)| (b.as_slice(), *s)).collect();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&serialize_vocab(&borrowed)).unwrap();
    file.flush().unwrap();

    let tokenizer = Tokenizer::new(file.path(), entries.len()).unwrap();
    assert_eq!(tokenizer.piece(HE), b"he");
}

#[test]
fn test_truncated_file_fails() {
    let entries = test_vocab();
    let borrowed: Vec<(&[u8], f32)> = entries.iter().map(|(b, s)| (b.as_slice(), *s)).collect();
    let mut data = serialize_vocab(&borrowed);
    data.truncate(data.len() - 3);

    assert!(Tokenizer::from_reader(Cursor::new(data), entries.len()).is_err());

    // asking for more entries than the file holds
    let data = serialize_vocab(&borrowed);
    assert!(Tokenizer::from_reader(Cursor::new(data), entries.len() + 1).is_err());
}

#[test]
fn test_too_small_vocab_fails() {
    let entries: [(&[u8], f32); 2] = [(b"<unk>", 0.0), (b"<s>", 0.0)];
    let data = serialize_vocab(&entries);
    assert!(Tokenizer::from_reader(Cursor::new(data), 2).is_err());
}

#[test]
fn test_encode_merges_best_pairs() {
    let tokenizer = test_tokenizer();

    assert_eq!(tokenizer.encode("hello", true, false), vec![BOS_TOKEN_ID, SPACE_HELLO]);
    assert_eq!(tokenizer.encode("hello", false, true), vec![SPACE_HELLO, EOS_TOKEN_ID]);
    assert_eq!(tokenizer.encode("hello hello", true, true), vec![BOS_TOKEN_ID, SPACE_HELLO, SPACE_HELLO, EOS_TOKEN_ID]);
}

#[test]
fn test_encode_empty_text() {
    let tokenizer = test_tokenizer();

    assert_eq!(tokenizer.encode("", true, false), vec![BOS_TOKEN_ID]);
    assert!(tokenizer.encode("", false, false).is_empty());
}

#[test]
fn test_round_trip() {
    let tokenizer = test_tokenizer();

    for text in ["hello", "hello hello", "he ll", "hole", "ooh hell"] {
        let tokens = tokenizer.encode(text, true, false);
        assert_eq!(decode_all(&tokenizer, &tokens), text.as_bytes(), "text {text:?}");
    }
}

#[test]
fn test_merge_never_increases_token_count() {
    let tokenizer = test_tokenizer();

    for text in ["hello", "hhheeellllooo", "lol", "é hello é"] {
        let tokens = tokenizer.encode(text, false, false);
        // one token per byte plus the leading space is the unmerged upper bound
        assert!(tokens.len() <= text.len() + 1, "text {text:?} produced {tokens:?}");
    }
}

#[test]
fn test_merge_is_bounded_by_initial_tokens() {
    let tokenizer = test_tokenizer();

    for text in [" hello", " hhheeellllooo", " lol", " hole"] {
        let initial: Vec<usize> = text.bytes().map(|b| tokenizer.str_lookup(&[b]).unwrap()).collect();
        let mut tokens = initial.clone();

        let merges = tokenizer.merge(&mut tokens);

        assert!(merges < initial.len(), "text {text:?} merged {merges} times");
        assert_eq!(tokens.len(), initial.len() - merges);

        let pieces: Vec<u8> = tokens.iter().flat_map(|&token| tokenizer.piece(token).to_vec()).collect();
        assert_eq!(pieces, text.as_bytes());
    }

    let mut tokens: Vec<usize> = " hello".bytes().map(|b| tokenizer.str_lookup(&[b]).unwrap()).collect();
    assert_eq!(tokenizer.merge(&mut tokens), 5);
    assert_eq!(tokens, vec![SPACE_HELLO]);
}

#[test]
fn test_token_longer_than_declared_maximum() {
    // max length 2, then a token claiming i32::MAX bytes
    let mut bytes = 2i32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&0.0f32.to_le_bytes());
    bytes.extend_from_slice(&i32::MAX.to_le_bytes());

    let error = Tokenizer::from_reader(Cursor::new(bytes), 3).unwrap_err();
    assert!(error.to_string().contains("above the declared maximum 2"), "unexpected error: {error}");
}

#[test]
fn test_byte_fallback() {
    let tokenizer = test_tokenizer();

    let tokens = tokenizer.encode("h!", false, false);
    assert_eq!(tokens, vec![SPACE, tokenizer.str_lookup(b"h").unwrap(), b'!' as usize + BYTE_FALLBACK_OFFSET]);
}

#[test]
fn test_multibyte_boundaries() {
    let tokenizer = test_tokenizer();

    // known two-byte code point is a single token
    assert_eq!(tokenizer.encode("é", false, false), vec![SPACE, E_ACUTE]);

    // unknown code points fall back per byte and never split a neighbour
    let text = "hé😀ü";
    let tokens = tokenizer.encode(text, false, false);
    let byte_tokens = |s: &str| s.bytes().map(|b| b as usize + BYTE_FALLBACK_OFFSET).collect::<Vec<_>>();

    let mut expected = vec![SPACE, tokenizer.str_lookup(b"h").unwrap(), E_ACUTE];
    expected.extend(byte_tokens("😀"));
    expected.extend(byte_tokens("ü"));
    assert_eq!(tokens, expected);

    let mut with_bos = vec![BOS_TOKEN_ID];
    with_bos.extend(tokens);
    assert_eq!(decode_all(&tokenizer, &with_bos), text.as_bytes());
}

#[test]
fn test_decode_byte_piece_and_bos_space() {
    let tokenizer = test_tokenizer();

    assert_eq!(tokenizer.decode(SPACE, 0x41 + BYTE_FALLBACK_OFFSET), b"A");
    assert_eq!(tokenizer.decode(BOS_TOKEN_ID, SPACE_HELLO), b"hello");
    assert_eq!(tokenizer.decode(HELLO, SPACE_HELLO), b" hello");
    assert_eq!(tokenizer.decode(BOS_TOKEN_ID, 0xC3 + BYTE_FALLBACK_OFFSET), &[0xC3]);
}

#[test]
fn test_missing_space_and_small_vocab_fallback() {
    let entries: [(&[u8], f32); 6] =
        [(b"<unk>", 0.0), (b"<s>", 0.0), (b"</s>", 0.0), (b"a", 0.0), (b"b", 0.0), (b"ab", 1.0)];
    let data = serialize_vocab(&entries);
    let tokenizer = Tokenizer::from_reader(Cursor::new(data), 6).unwrap();

    // the space has neither a token nor a byte token, so it becomes unknown
    assert_eq!(tokenizer.encode("ab", true, false), vec![BOS_TOKEN_ID, UNK_TOKEN_ID, 5]);
}
