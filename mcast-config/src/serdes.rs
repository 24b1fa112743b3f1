pub(crate) fn serialize_address_space<S>(space: &crate::AddressSpace, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize;
    space.to_string().serialize(serializer)
}

pub(crate) fn deserialize_address_space<'de, D>(deserializer: D) -> Result<crate::AddressSpace, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let string = String::deserialize(deserializer)?;
    string.parse().map_err(serde::de::Error::custom)
}

// TODO: Make this support values like "100us"/"100ns"/"100ms" etc.
pub(crate) fn serialize_duration<S>(duration: &std::time::Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize;
    duration.as_secs_f64().serialize(serializer)
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let seconds = f64::deserialize(deserializer)?;
    std::time::Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
}

pub(crate) fn deserialize_nonzero_duration<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let duration = deserialize_duration(deserializer)?;
    if duration.is_zero() {
        return Err(serde::de::Error::custom("duration must be greater than zero"));
    }
    Ok(duration)
}

pub(crate) fn serialize_optional_duration<S>(
    duration: &Option<std::time::Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize;
    duration.map(|duration| duration.as_secs_f64()).serialize(serializer)
}

pub(crate) fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<std::time::Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Option::<f64>::deserialize(deserializer)?
        .map(|seconds| std::time::Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom))
        .transpose()
}
